use proc_macro2::TokenStream;
use quote::quote;
use syn::spanned::Spanned;
use syn::{Data, DeriveInput, Fields, LitStr, Type};

enum Role {
    Status,
    Header(LitStr),
    Cookie(LitStr),
    Body,
}

pub(crate) fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(name.span(), "Output can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(name.span(), "Output requires named fields"));
    };

    let mut writes = Vec::new();
    let mut headers = Vec::new();
    let mut body: Option<(&syn::Ident, &Type)> = None;

    for field in &fields.named {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let ty = &field.ty;
        for role in roles(field)? {
            match role {
                Role::Status => writes.push(quote! {
                    if let ::core::option::Option::Some(code) =
                        ::micro_api::output::StatusField::status_code(&self.#ident)?
                    {
                        status = code;
                    }
                }),
                Role::Header(header) => {
                    writes.push(quote! {
                        if let ::core::option::Option::Some(value) =
                            ::micro_api::output::HeaderField::header_value(&self.#ident)
                        {
                            ctx.set_header(#header, value)?;
                        }
                    });
                    headers.push(quote! {
                        doc = doc.header(#header, registry.resolve::<#ty>());
                    });
                }
                Role::Cookie(cookie) => writes.push(quote! {
                    if let ::core::option::Option::Some(cookie) =
                        ::micro_api::output::CookieField::cookie(&self.#ident, #cookie)
                    {
                        ctx.set_cookie(cookie)?;
                    }
                }),
                Role::Body => {
                    if body.is_some() {
                        return Err(syn::Error::new(field.span(), "only one field can be the output body"));
                    }
                    body = Some((ident, ty));
                }
            }
        }
    }

    let (payload, schema) = match body {
        Some((ident, ty)) => (quote! { &self.#ident }, quote! { registry.resolve::<#ty>() }),
        None => (quote! { &self }, quote! { registry.resolve::<Self>() }),
    };

    Ok(quote! {
        impl #impl_generics ::micro_api::Output for #name #ty_generics #where_clause {
            fn write_to(
                self,
                ctx: &mut ::micro_api::Context,
                status: ::micro_api::StatusCode,
            ) -> ::core::result::Result<(), ::micro_api::WebError> {
                #[allow(unused_mut)]
                let mut status = status;
                #(#writes)*
                ctx.negotiate(status, #payload)
            }

            fn describe(
                registry: &mut ::micro_api::openapi::SchemaRegistry,
            ) -> ::micro_api::output::OutputDoc {
                #[allow(unused_mut)]
                let mut doc = ::micro_api::output::OutputDoc::negotiated(#schema);
                #(#headers)*
                doc
            }
        }
    })
}

fn roles(field: &syn::Field) -> syn::Result<Vec<Role>> {
    let mut roles = Vec::new();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("output")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("status") {
                roles.push(Role::Status);
            } else if meta.path.is_ident("body") {
                roles.push(Role::Body);
            } else if meta.path.is_ident("header") {
                roles.push(Role::Header(meta.value()?.parse()?));
            } else if meta.path.is_ident("cookie") {
                roles.push(Role::Cookie(meta.value()?.parse()?));
            } else {
                return Err(meta.error("expected `status`, `header`, `cookie` or `body`"));
            }
            Ok(())
        })?;
    }
    Ok(roles)
}
