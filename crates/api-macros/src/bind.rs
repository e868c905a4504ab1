use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::spanned::Spanned;
use syn::{Data, DeriveInput, Expr, ExprLit, ExprUnary, Field, Fields, Lit, UnOp};

/// Snake-case attribute keys and the annotation keys they stand for.
const KEYS: &[(&str, &str)] = &[
    ("path", "path"),
    ("query", "query"),
    ("header", "header"),
    ("cookie", "cookie"),
    ("form", "form"),
    ("file", "form-file"),
    ("form_file", "form-file"),
    ("json", "json"),
    ("xml", "xml"),
    ("yaml", "yaml"),
    ("body", "body"),
    ("nested", "nested"),
    ("required", "required"),
    ("default", "default"),
    ("min", "min"),
    ("max", "max"),
    ("min_length", "minLength"),
    ("max_length", "maxLength"),
    ("multiple_of", "multipleOf"),
    ("min_items", "minItems"),
    ("max_items", "maxItems"),
    ("unique_items", "uniqueItems"),
    ("pattern", "pattern"),
    ("enum", "enum"),
    ("enum_values", "enum"),
    ("format", "format"),
    ("description", "description"),
    ("example", "example"),
    ("deprecated", "deprecated"),
    ("hidden", "hidden"),
];

struct FieldAttrs {
    annotations: Vec<(String, String)>,
    nested: bool,
    skip: bool,
}

pub(crate) fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(input.generics.span(), "Bind cannot be derived for generic types"));
    }
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(name.span(), "Bind can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(name.span(), "Bind requires named fields"));
    };

    let mut specs = Vec::new();
    for field in &fields.named {
        let attrs = field_attrs(field)?;
        if attrs.skip {
            continue;
        }
        specs.push(field_spec(name, field, &attrs));
    }
    let type_name = name.to_string();

    Ok(quote! {
        impl ::micro_api::Bind for #name {
            fn plan() -> ::core::result::Result<
                &'static ::micro_api::__private::BindPlan<Self>,
                ::micro_api::__private::TagError,
            > {
                static PLAN: ::std::sync::OnceLock<
                    ::core::result::Result<
                        ::micro_api::__private::BindPlan<#name>,
                        ::micro_api::__private::TagError,
                    >,
                > = ::std::sync::OnceLock::new();
                PLAN.get_or_init(|| {
                    ::micro_api::__private::BindPlan::new(#type_name, ::std::vec![#(#specs),*])
                })
                .as_ref()
                .map_err(::core::clone::Clone::clone)
            }
        }

        impl ::micro_api::__private::FieldValue for #name {
            fn from_text(
                _values: &[::std::string::String],
                _tags: &::micro_api::__private::TagSet,
            ) -> ::core::result::Result<Self, ::micro_api::__private::DecodeError> {
                ::core::result::Result::Err(::micro_api::__private::DecodeError::new("expected an object"))
            }

            fn from_json(
                value: ::micro_api::__private::Value,
                _tags: &::micro_api::__private::TagSet,
            ) -> ::core::result::Result<Self, ::micro_api::__private::DecodeError> {
                ::micro_api::__private::record_from_json::<Self>(value)
            }

            fn view(&self) -> ::micro_api::__private::FieldView<'_> {
                ::micro_api::__private::FieldView::Record(self)
            }
        }

        impl ::micro_api::__private::ToSchema for #name {
            fn schema_name() -> ::core::option::Option<::std::borrow::Cow<'static, str>> {
                ::core::option::Option::Some(::std::borrow::Cow::Borrowed(#type_name))
            }

            fn schema(
                registry: &mut ::micro_api::__private::SchemaRegistry,
            ) -> ::micro_api::__private::Schema {
                ::micro_api::__private::record_schema::<Self>(registry)
            }
        }
    })
}

fn field_attrs(field: &Field) -> syn::Result<FieldAttrs> {
    let mut attrs = FieldAttrs { annotations: Vec::new(), nested: false, skip: false };
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("bind")) {
        attr.parse_nested_meta(|meta| {
            let key = meta.path.get_ident().map(|ident| ident.unraw().to_string()).unwrap_or_default();
            if key == "skip" {
                attrs.skip = true;
                return Ok(());
            }
            let Some((_, canonical)) = KEYS.iter().find(|(k, _)| *k == key) else {
                return Err(meta.error(format!("unknown bind key `{key}`")));
            };
            let value = if meta.input.peek(syn::Token![=]) {
                let expr: Expr = meta.value()?.parse()?;
                literal_text(&expr)?
            } else {
                String::new()
            };
            if *canonical == "nested" {
                attrs.nested = true;
            }
            attrs.annotations.push(((*canonical).to_owned(), value));
            Ok(())
        })?;
    }
    Ok(attrs)
}

/// The textual form of a literal annotation value; negative numbers are accepted.
fn literal_text(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit { lit, .. }) => match lit {
            Lit::Str(s) => Ok(s.value()),
            Lit::Int(i) => Ok(i.base10_digits().to_owned()),
            Lit::Float(f) => Ok(f.base10_digits().to_owned()),
            Lit::Bool(b) => Ok(b.value.to_string()),
            other => Err(syn::Error::new(other.span(), "expected a string, number or bool literal")),
        },
        Expr::Unary(ExprUnary { op: UnOp::Neg(_), expr, .. }) => Ok(format!("-{}", literal_text(expr)?)),
        other => Err(syn::Error::new(other.span(), "expected a literal")),
    }
}

fn field_spec(record: &syn::Ident, field: &Field, attrs: &FieldAttrs) -> TokenStream {
    let Some(ident) = field.ident.as_ref() else {
        return syn::Error::new(field.span(), "Bind requires named fields").into_compile_error();
    };
    let ty = &field.ty;
    let field_name = ident.unraw().to_string();
    let keys = attrs.annotations.iter().map(|(k, _)| k);
    let values = attrs.annotations.iter().map(|(_, v)| v);

    let set_text = format_ident!("__set_text_{}", field_name);
    let set_json = format_ident!("__set_json_{}", field_name);
    let set_files = format_ident!("__set_files_{}", field_name);
    let set_payload = format_ident!("__set_payload_{}", field_name);
    let view = format_ident!("__view_{}", field_name);

    let (set_nested, nested_plan) = if attrs.nested {
        (
            quote! {{
                fn __set_nested(
                    dest: &mut #record,
                    sources: &mut ::micro_api::__private::Sources<'_>,
                ) -> ::core::result::Result<(), ::micro_api::WebError> {
                    ::micro_api::__private::bind_nested::<#ty>(&mut dest.#ident, sources)
                }
                ::core::option::Option::Some(__set_nested)
            }},
            quote! { ::core::option::Option::Some(::micro_api::__private::plan_info::<#ty>) },
        )
    } else {
        (quote! { ::core::option::Option::None }, quote! { ::core::option::Option::None })
    };

    quote! {{
        #[allow(non_snake_case)]
        fn #set_text(
            dest: &mut #record,
            values: &[::std::string::String],
            tags: &::micro_api::__private::TagSet,
        ) -> ::core::result::Result<(), ::micro_api::__private::DecodeError> {
            dest.#ident = <#ty as ::micro_api::__private::FieldValue>::from_text(values, tags)?;
            ::core::result::Result::Ok(())
        }

        #[allow(non_snake_case)]
        fn #set_json(
            dest: &mut #record,
            value: ::micro_api::__private::Value,
            tags: &::micro_api::__private::TagSet,
        ) -> ::core::result::Result<(), ::micro_api::__private::DecodeError> {
            dest.#ident = <#ty as ::micro_api::__private::FieldValue>::from_json(value, tags)?;
            ::core::result::Result::Ok(())
        }

        #[allow(non_snake_case)]
        fn #set_files(
            dest: &mut #record,
            files: ::std::vec::Vec<::micro_api::UploadedFile>,
        ) -> ::core::result::Result<(), ::micro_api::__private::DecodeError> {
            dest.#ident = <#ty as ::micro_api::__private::FieldValue>::from_files(files)?;
            ::core::result::Result::Ok(())
        }

        #[allow(non_snake_case)]
        fn #set_payload(
            dest: &mut #record,
            media: ::micro_api::__private::MediaType,
            payload: &::micro_api::__private::Bytes,
            tags: &::micro_api::__private::TagSet,
        ) -> ::core::result::Result<(), ::micro_api::__private::CodecError> {
            dest.#ident = <#ty as ::micro_api::__private::FieldValue>::from_payload(media, payload, tags)?;
            ::core::result::Result::Ok(())
        }

        #[allow(non_snake_case)]
        fn #view(dest: &#record) -> ::micro_api::__private::FieldView<'_> {
            <#ty as ::micro_api::__private::FieldValue>::view(&dest.#ident)
        }

        ::micro_api::__private::FieldSpec::<#record> {
            ident: #field_name,
            annotations: &[#((#keys, #values)),*],
            schema: ::micro_api::__private::SchemaRegistry::resolve::<#ty>,
            accepts_files: <#ty as ::micro_api::__private::FieldValue>::ACCEPTS_FILES,
            set_text: #set_text,
            set_json: #set_json,
            set_files: #set_files,
            set_payload: #set_payload,
            set_nested: #set_nested,
            nested_plan: #nested_plan,
            view: #view,
        }
    }}
}
