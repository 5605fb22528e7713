//! HTTPS transport for doclink.
//!
//! To use this transport, include the `http` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! doclink = { version = "x.y.z", features = ["http"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use doclink::{prelude::*, http::ReqwestTransport};
//! use std::{sync::Arc, time::Duration};
//!
//! let transport = ReqwestTransport::builder()
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//!
//! let client = Client::builder("https://account.documents.example.com")
//!     .transport(Arc::new(transport))
//!     // ...
//!     .build()
//!     .await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as doclink_http;

pub mod transport;

pub use transport::{ReqwestTransport, ReqwestTransportBuilder};
