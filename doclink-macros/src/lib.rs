//! Procedural macros for the doclink project.
//!
//! Provides `#[derive(Resource)]`, which ties a serde type to the resource kind it is stored
//! as:
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize, Resource)]
//! #[resource(kind = "collection")]
//! pub struct Collection {
//!     pub id: String,
//! }
//! ```
//!
//! Without a `#[resource(kind = ...)]` attribute the type is stored as a document.

#[allow(unused_extern_crates)]
extern crate self as doclink_macros;

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{DeriveInput, Ident, LitStr, parse_macro_input};

const KINDS: [(&str, &str); 9] = [
    ("database", "Database"),
    ("collection", "Collection"),
    ("document", "Document"),
    ("stored_procedure", "StoredProcedure"),
    ("trigger", "Trigger"),
    ("user_defined_function", "UserDefinedFunction"),
    ("user", "User"),
    ("permission", "Permission"),
    ("attachment", "Attachment"),
];

fn resource_kind(input: &DeriveInput) -> syn::Result<Ident> {
    let mut kind = None;

    for attr in input.attrs.iter().filter(|a| a.path().is_ident("resource")) {
        attr.parse_nested_meta(|meta| {
            if !meta.path.is_ident("kind") {
                return Err(meta.error("expected `kind = \"...\"`"));
            }

            let value: LitStr = meta.value()?.parse()?;
            let variant = KINDS
                .iter()
                .find(|(name, _)| *name == value.value())
                .map(|(_, variant)| *variant)
                .ok_or_else(|| {
                    syn::Error::new(
                        value.span(),
                        format!(
                            "unknown resource kind `{}`, expected one of: {}",
                            value.value(),
                            KINDS.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", ")
                        ),
                    )
                })?;

            kind = Some(Ident::new(variant, value.span()));
            Ok(())
        })?;
    }

    Ok(kind.unwrap_or_else(|| Ident::new("Document", Span::call_site())))
}

/// Derives `doclink::resource::Resource`.
#[proc_macro_derive(Resource, attributes(resource))]
pub fn derive_resource(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let kind = match resource_kind(&input) {
        Ok(kind) => kind,
        Err(err) => return err.to_compile_error().into(),
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    quote! {
        impl #impl_generics ::doclink::resource::Resource for #name #ty_generics #where_clause {
            fn kind() -> ::doclink::address::ResourceKind {
                ::doclink::address::ResourceKind::#kind
            }
        }
    }
    .into()
}
