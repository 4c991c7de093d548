// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `#[derive(FieldAccess)]` for structs with named fields
//!
//! Supported field shapes:
//! - scalars: `i64`, `f64`, `bool`, `String`, and `Option<_>` of those;
//! - scalar arrays: `Vec<i64|f64|bool|String>`;
//! - `persist_proxy::LazyRef<X>` — admits a lazy reference;
//! - any other named type path `X` — treated as a concretely-typed
//!   embedded composite, which forces eager resolution on decode (spec
//!   §4.8: "Concrete single-class declarations force eager resolution").
//!
//! A field literally named `uuid` typed `Option<persist_uuid::RecordId>` is
//! recognized as the conventional inline-identity slot and
//! backs generated `record_id`/`set_record_id` overrides; structs without
//! such a field fall back to the trait's default (`None`/no-op), and the
//! engine's process-local identity map takes over instead.
//!
//! Every field type must implement `Clone`; composite field types
//! (`LazyRef<X>` and the bare-`X` case) additionally need `FieldAccess`,
//! and `X` itself needs `Default` (the instantiate-without-constructor
//! mapping, see `persist_reflect::Instantiate`).
//!
//! The host struct itself must derive `Clone` and `Default` alongside
//! `FieldAccess` — `Default` backs [`persist_reflect::Instantiate`], and
//! `Clone` backs [`persist_reflect::FieldAccess::clone_box`], used
//! whenever a nested composite needs to be snapshotted into a
//! [`persist_reflect::FieldValue::Composite`].

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, GenericArgument, PathArguments, Type};

/// Derive [`persist_reflect::FieldAccess`] and [`persist_reflect::Instantiate`]
/// for a struct with named fields.
#[proc_macro_derive(FieldAccess)]
pub fn derive_field_access(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let ident = &input.ident;
    let class_name = ident.to_string();

    let Data::Struct(data) = &input.data else {
        return syn::Error::new_spanned(&input, "FieldAccess can only be derived for structs")
            .to_compile_error()
            .into();
    };
    let Fields::Named(named) = &data.fields else {
        return syn::Error::new_spanned(&input, "FieldAccess requires named fields")
            .to_compile_error()
            .into();
    };

    let fields: Vec<(&syn::Ident, &Type)> = named
        .named
        .iter()
        .filter_map(|f| f.ident.as_ref().map(|i| (i, &f.ty)))
        .collect();

    let field_name_strs: Vec<String> = fields.iter().map(|(i, _)| i.to_string()).collect();

    let declared_type_arms = fields.iter().map(|(ident, ty)| {
        let name = ident.to_string();
        let kind = declared_type_expr(ty);
        quote! { #name => ::core::option::Option::Some(#kind), }
    });

    let get_field_arms = fields.iter().map(|(ident, ty)| {
        let name = ident.to_string();
        let expr = get_field_expr(ident, ty);
        quote! { #name => ::core::result::Result::Ok(#expr), }
    });

    let set_field_arms = fields.iter().map(|(ident, ty)| {
        let name = ident.to_string();
        let body = set_field_body(ident, ty);
        quote! { #name => { #body } }
    });

    let unset_field_arms = fields.iter().map(|(ident, _ty)| {
        let name = ident.to_string();
        quote! { #name => { self.#ident = ::core::default::Default::default(); ::core::result::Result::Ok(()) } }
    });

    let proxy_field_name_strs: Vec<String> = fields
        .iter()
        .filter(|(_, ty)| is_lazy_ref(ty))
        .map(|(i, _)| i.to_string())
        .collect();

    let wire_arms = fields.iter().filter(|(_, ty)| is_lazy_ref(ty)).map(|(ident, _)| {
        let name = ident.to_string();
        quote! {
            #name => {
                self.#ident.wire(loader);
                ::core::result::Result::Ok(())
            }
        }
    });

    // A field literally named `uuid` typed `Option<RecordId>` is the
    // conventional inline-identity slot When present, generate `record_id`/`set_record_id`
    // overrides backed by it so the value survives `clone_box` instead of
    // defaulting to the trait's `None`/no-op (the pointer address of a
    // fresh `Box::new(self.#ident.clone())` is not stable across reads).
    let uuid_field = fields.iter().find(|(ident, ty)| {
        ident.to_string() == "uuid" && is_record_id_option(ty)
    });
    let identity_methods = uuid_field.map(|(ident, _)| {
        quote! {
            fn record_id(&self) -> ::core::option::Option<::persist_uuid::RecordId> {
                self.#ident
            }

            fn set_record_id(&mut self, id: ::persist_uuid::RecordId) {
                self.#ident = ::core::option::Option::Some(id);
            }
        }
    });

    let expanded: TokenStream2 = quote! {
        impl ::persist_reflect::FieldAccess for #ident {
            fn class_name(&self) -> &'static str {
                #class_name
            }

            fn field_names(&self) -> &'static [&'static str] {
                &[#(#field_name_strs),*]
            }

            fn declared_type(&self, name: &str) -> ::core::option::Option<::persist_reflect::FieldType> {
                match name {
                    #(#declared_type_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            fn is_initialized(&self, name: &str) -> bool {
                self.field_names().contains(&name)
            }

            fn get_field(&self, name: &str) -> ::core::result::Result<::persist_reflect::FieldValue, ::persist_reflect::ReflectError> {
                match name {
                    #(#get_field_arms)*
                    _ => ::core::result::Result::Err(::persist_reflect::ReflectError::UnknownField(name.to_owned(), #class_name)),
                }
            }

            fn set_field(&mut self, name: &str, value: ::persist_reflect::FieldValue) -> ::core::result::Result<(), ::persist_reflect::ReflectError> {
                match name {
                    #(#set_field_arms)*
                    _ => ::core::result::Result::Err(::persist_reflect::ReflectError::UnknownField(name.to_owned(), #class_name)),
                }
            }

            fn unset_field(&mut self, name: &str) -> ::core::result::Result<(), ::persist_reflect::ReflectError> {
                match name {
                    #(#unset_field_arms)*
                    _ => ::core::result::Result::Err(::persist_reflect::ReflectError::UnknownField(name.to_owned(), #class_name)),
                }
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::core::any::Any {
                self
            }

            fn into_any_box(self: ::std::boxed::Box<Self>) -> ::std::boxed::Box<dyn ::core::any::Any> {
                self
            }

            fn clone_box(&self) -> ::std::boxed::Box<dyn ::persist_reflect::FieldAccess> {
                ::std::boxed::Box::new(::core::clone::Clone::clone(self))
            }

            #identity_methods
        }

        impl ::persist_reflect::Instantiate for #ident {
            fn instantiate_uninitialized() -> Self {
                ::core::default::Default::default()
            }
        }

        impl #ident {
            /// Wire a decode-time lazy-proxy field (`persist_proxy::LazyRef<_>`)
            /// with its loader. Fails with `UnknownField` for any name that is
            /// not one of [`Self::proxy_field_names`].
            pub fn wire_proxy_field(
                &mut self,
                name: &str,
                loader: ::std::rc::Weak<dyn ::persist_proxy::ProxyLoader>,
            ) -> ::core::result::Result<(), ::persist_reflect::ReflectError> {
                match name {
                    #(#wire_arms)*
                    _ => ::core::result::Result::Err(::persist_reflect::ReflectError::UnknownField(name.to_owned(), #class_name)),
                }
            }

            /// Names of this struct's `LazyRef<_>`-typed fields, i.e. those
            /// admitting an unresolved proxy
            #[must_use]
            pub fn proxy_field_names() -> &'static [&'static str] {
                &[#(#proxy_field_name_strs),*]
            }
        }
    };
    expanded.into()
}

fn is_option(ty: &Type) -> Option<&Type> {
    generic_single_arg(ty, "Option")
}

fn is_vec(ty: &Type) -> Option<&Type> {
    generic_single_arg(ty, "Vec")
}

fn is_lazy_ref(ty: &Type) -> bool {
    generic_single_arg(ty, "LazyRef").is_some()
}

/// Is `ty` exactly `Option<RecordId>` (any import path ending in `RecordId`)?
fn is_record_id_option(ty: &Type) -> bool {
    is_option(ty).is_some_and(|inner| {
        let Type::Path(path) = inner else { return false };
        path.path.segments.last().is_some_and(|s| s.ident == "RecordId")
    })
}

fn generic_single_arg<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(path) = ty else { return None };
    let segment = path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    args.args.iter().find_map(|a| match a {
        GenericArgument::Type(t) => Some(t),
        _ => None,
    })
}

/// `(ScalarKind variant name, parser ident)` for a scalar leaf type.
fn scalar_kind(ty: &Type) -> Option<&'static str> {
    let Type::Path(path) = ty else { return None };
    let ident = &path.path.segments.last()?.ident;
    match ident.to_string().as_str() {
        "i64" => Some("Int"),
        "f64" => Some("Float"),
        "bool" => Some("Bool"),
        "String" => Some("Str"),
        _ => None,
    }
}

fn declared_type_expr(ty: &Type) -> TokenStream2 {
    if is_lazy_ref(ty) {
        return quote! { ::persist_reflect::FieldType::ProxyOrAny };
    }
    let scalar_ty = is_option(ty).unwrap_or(ty);
    if let Some(kind) = scalar_kind(scalar_ty) {
        let kind_ident = syn::Ident::new(kind, proc_macro2::Span::call_site());
        return quote! { ::persist_reflect::FieldType::Scalar(::persist_reflect::ScalarKind::#kind_ident) };
    }
    if is_vec(ty).is_some() {
        return quote! { ::persist_reflect::FieldType::Container };
    }
    quote! { ::persist_reflect::FieldType::Concrete }
}

fn get_field_expr(ident: &syn::Ident, ty: &Type) -> TokenStream2 {
    if is_lazy_ref(ty) {
        return quote! { self.#ident.snapshot() };
    }
    if let Some(inner) = is_option(ty) {
        let wrap = scalar_wrap(inner, quote! { v });
        return quote! {
            match &self.#ident {
                ::core::option::Option::Some(v) => #wrap,
                ::core::option::Option::None => ::persist_reflect::FieldValue::Null,
            }
        };
    }
    if let Some(inner) = is_vec(ty) {
        let wrap = scalar_wrap(inner, quote! { v });
        return quote! {
            ::persist_reflect::FieldValue::Array(
                self.#ident.iter().map(|v| #wrap).collect()
            )
        };
    }
    if scalar_kind(ty).is_some() {
        return scalar_wrap(ty, quote! { (&self.#ident) });
    }
    // Concrete nested composite: clone and box for the caller to recurse
    // into
    quote! { ::persist_reflect::FieldValue::Composite(::std::boxed::Box::new(self.#ident.clone())) }
}

fn scalar_wrap(ty: &Type, expr: TokenStream2) -> TokenStream2 {
    match scalar_kind(ty) {
        Some("Int") => quote! { ::persist_reflect::FieldValue::Int(i64::from(*#expr)) },
        Some("Float") => quote! { ::persist_reflect::FieldValue::Float(f64::from(*#expr)) },
        Some("Bool") => quote! { ::persist_reflect::FieldValue::Bool(*#expr) },
        Some("Str") => quote! { ::persist_reflect::FieldValue::Str(#expr.clone()) },
        _ => quote! { ::persist_reflect::FieldValue::Null },
    }
}

/// A closure literal turning a decoded [`persist_reflect::FieldValue`]
/// scalar (after [`persist_reflect::coerce_scalar`] has run) into the
/// field's native Rust type.
fn scalar_unwrap_closure(ty: &Type) -> TokenStream2 {
    match scalar_kind(ty) {
        Some("Int") => quote! {
            |v: ::persist_reflect::FieldValue| -> ::core::result::Result<_, ::persist_reflect::ReflectError> {
                match v {
                    ::persist_reflect::FieldValue::Int(n) => ::core::result::Result::Ok(n as _),
                    other => ::core::result::Result::Err(::persist_reflect::ReflectError::WrongShape(format!("{other:?}"))),
                }
            }
        },
        Some("Float") => quote! {
            |v: ::persist_reflect::FieldValue| -> ::core::result::Result<_, ::persist_reflect::ReflectError> {
                match v {
                    ::persist_reflect::FieldValue::Float(n) => ::core::result::Result::Ok(n as _),
                    other => ::core::result::Result::Err(::persist_reflect::ReflectError::WrongShape(format!("{other:?}"))),
                }
            }
        },
        Some("Bool") => quote! {
            |v: ::persist_reflect::FieldValue| -> ::core::result::Result<_, ::persist_reflect::ReflectError> {
                match v {
                    ::persist_reflect::FieldValue::Bool(b) => ::core::result::Result::Ok(b),
                    other => ::core::result::Result::Err(::persist_reflect::ReflectError::WrongShape(format!("{other:?}"))),
                }
            }
        },
        Some("Str") => quote! {
            |v: ::persist_reflect::FieldValue| -> ::core::result::Result<_, ::persist_reflect::ReflectError> {
                match v {
                    ::persist_reflect::FieldValue::Str(s) => ::core::result::Result::Ok(s),
                    other => ::core::result::Result::Err(::persist_reflect::ReflectError::WrongShape(format!("{other:?}"))),
                }
            }
        },
        _ => quote! { |_: ::persist_reflect::FieldValue| -> ::core::result::Result<_, ::persist_reflect::ReflectError> { unreachable!() } },
    }
}

fn set_field_body(ident: &syn::Ident, ty: &Type) -> TokenStream2 {
    if is_lazy_ref(ty) {
        let inner = generic_single_arg(ty, "LazyRef").expect("checked by is_lazy_ref");
        return quote! {
            match value {
                ::persist_reflect::FieldValue::Unresolved(target) => {
                    self.#ident = ::persist_proxy::LazyRef::<#inner>::unloaded(target);
                    ::core::result::Result::Ok(())
                }
                ::persist_reflect::FieldValue::Composite(boxed) => {
                    let concrete = boxed
                        .as_any()
                        .downcast_ref::<#inner>()
                        .ok_or_else(|| ::persist_reflect::ReflectError::WrongShape(stringify!(#ident).to_owned()))?
                        .clone();
                    self.#ident = ::persist_proxy::LazyRef::<#inner>::loaded(concrete);
                    ::core::result::Result::Ok(())
                }
                other => ::core::result::Result::Err(::persist_reflect::ReflectError::WrongShape(format!("{other:?}"))),
            }
        };
    }
    if let Some(inner) = is_option(ty) {
        let kind_ident = syn::Ident::new(
            scalar_kind(inner).unwrap_or("Str"),
            proc_macro2::Span::call_site(),
        );
        let parse = scalar_unwrap_closure(inner);
        return quote! {
            match value {
                ::persist_reflect::FieldValue::Null => {
                    self.#ident = ::core::option::Option::None;
                    ::core::result::Result::Ok(())
                }
                other => {
                    let coerced = ::persist_reflect::coerce_scalar(
                        stringify!(#ident),
                        &other,
                        ::persist_reflect::ScalarKind::#kind_ident,
                    )?;
                    self.#ident = ::core::option::Option::Some((#parse)(coerced)?);
                    ::core::result::Result::Ok(())
                }
            }
        };
    }
    if let Some(inner) = is_vec(ty) {
        let kind_ident = syn::Ident::new(
            scalar_kind(inner).unwrap_or("Str"),
            proc_macro2::Span::call_site(),
        );
        let parse = scalar_unwrap_closure(inner);
        return quote! {
            match value {
                ::persist_reflect::FieldValue::Array(items) => {
                    let mut out = ::std::vec::Vec::with_capacity(items.len());
                    for item in items {
                        let coerced = ::persist_reflect::coerce_scalar(
                            stringify!(#ident),
                            &item,
                            ::persist_reflect::ScalarKind::#kind_ident,
                        )?;
                        out.push((#parse)(coerced)?);
                    }
                    self.#ident = out;
                    ::core::result::Result::Ok(())
                }
                other => ::core::result::Result::Err(::persist_reflect::ReflectError::WrongShape(format!("{other:?}"))),
            }
        };
    }
    if let Some(kind) = scalar_kind(ty) {
        let kind_ident = syn::Ident::new(kind, proc_macro2::Span::call_site());
        let parse = scalar_unwrap_closure(ty);
        return quote! {
            let coerced = ::persist_reflect::coerce_scalar(
                stringify!(#ident),
                &value,
                ::persist_reflect::ScalarKind::#kind_ident,
            )?;
            self.#ident = (#parse)(coerced)?;
            ::core::result::Result::Ok(())
        };
    }
    // Concrete nested composite — forced eager resolution; the decoder
    // never hands this branch an `Unresolved` value
    quote! {
        match value {
            ::persist_reflect::FieldValue::Composite(boxed) => {
                let any = boxed.into_any_box();
                self.#ident = *any
                    .downcast::<#ty>()
                    .map_err(|_| ::persist_reflect::ReflectError::WrongShape(stringify!(#ident).to_owned()))?;
                ::core::result::Result::Ok(())
            }
            other => ::core::result::Result::Err(::persist_reflect::ReflectError::WrongShape(format!("{other:?}"))),
        }
    }
}
