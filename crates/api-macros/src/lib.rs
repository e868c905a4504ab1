//! Derive macros for `micro-api`.
//!
//! Both derives only translate field annotations into data; the checks that need runtime types
//! (regex compilation, format names, source conflicts) happen when the bind plan is built.

mod bind;
mod output;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derives `Bind`, `FieldValue` and `ToSchema` for a struct with named fields.
///
/// ```ignore
/// #[derive(Default, Bind)]
/// struct ListBooks {
///     #[bind(query = "page", default = 1, min = 1)]
///     page: u32,
///     #[bind(header = "X-Tenant", required)]
///     tenant: String,
/// }
/// ```
#[proc_macro_derive(Bind, attributes(bind))]
pub fn derive_bind(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    bind::expand(input).unwrap_or_else(syn::Error::into_compile_error).into()
}

/// Derives `Output`, projecting `#[output(..)]` fields onto the response.
#[proc_macro_derive(Output, attributes(output))]
pub fn derive_output(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    output::expand(input).unwrap_or_else(syn::Error::into_compile_error).into()
}
