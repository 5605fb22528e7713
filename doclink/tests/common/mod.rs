#![allow(dead_code)]

use doclink::{memory::*, prelude::*};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

pub const ENDPOINT: &str = "https://acct.documents.example.com";
pub const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Resource)]
#[resource(kind = "database")]
pub struct Database {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Resource)]
#[resource(kind = "collection")]
pub struct Collection {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Resource)]
pub struct Order {
    pub id: String,
    pub owner: String,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Resource)]
#[resource(kind = "stored_procedure")]
pub struct Procedure {
    pub id: String,
    pub body: String,
}

pub fn order(id: &str, owner: &str, total: i64) -> Order {
    Order { id: id.into(), owner: owner.into(), total }
}

pub fn db() -> ResourceAddress {
    ResourceAddress::database("D1")
}

pub fn coll() -> ResourceAddress {
    db().child(ResourceKind::Collection, "C1")
}

pub fn doc(id: &str) -> ResourceAddress {
    coll().child(ResourceKind::Document, id)
}

/// A client wired to in-memory collaborators, with handles on all of them.
pub struct Harness {
    pub client: Client,
    pub service: InMemoryService,
    pub store: InMemoryStore,
    pub monitor: ManualConnectivity,
}

impl Harness {
    pub async fn new() -> Self {
        Self::over(InMemoryService::new(), InMemoryStore::new(), ManualConnectivity::new(true)).await
    }

    pub async fn over(service: InMemoryService, store: InMemoryStore, monitor: ManualConnectivity) -> Self {
        let client = Client::builder(ENDPOINT)
            .credential(Credential::owner(KEY))
            .transport(Arc::new(service.clone()))
            .store(Arc::new(store.clone()))
            .connectivity(Arc::new(monitor.clone()))
            .build()
            .await
            .unwrap();

        Self { client, service, store, monitor }
    }

    /// A harness with `D1/C1` already created.
    pub async fn with_collection() -> Self {
        let harness = Self::new().await;

        harness
            .client
            .create(None, &Database { id: "D1".into() })
            .await
            .unwrap();
        harness
            .client
            .create(Some(&db()), &Collection { id: "C1".into() })
            .await
            .unwrap();

        harness
    }
}

/// Waits until the client's queue is empty.
pub async fn until_drained(client: &Client) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.pending_writes().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
