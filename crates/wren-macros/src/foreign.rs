//! Implementation of the `#[foreign]` attribute macro.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    FnArg, GenericArgument, ImplItem, ImplItemFn, ItemImpl, Pat, PathArguments, ReturnType, Type,
    Visibility, parse_macro_input,
};

use crate::attrs::{ClassAttrs, MemberAttrs, strip_helper_attrs};

/// Parameter and return types the binder can coerce.
const SUPPORTED: &[&str] = &["bool", "i32", "i64", "f64", "String", "Value"];

pub fn foreign_impl(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attrs = match ClassAttrs::parse(attr.into()) {
        Ok(attrs) => attrs,
        Err(err) => return err.to_compile_error().into(),
    };

    let mut input = parse_macro_input!(item as ItemImpl);

    match foreign_inner(&attrs, &mut input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn foreign_inner(attrs: &ClassAttrs, input: &mut ItemImpl) -> syn::Result<TokenStream2> {
    if let Some((_, path, _)) = &input.trait_ {
        return Err(syn::Error::new_spanned(path, "#[foreign] goes on an inherent impl block"));
    }
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "#[foreign] does not support generic types",
        ));
    }

    let self_ty = input.self_ty.clone();
    let type_name = last_ident(&self_ty);
    let class_name = match (&attrs.name, &type_name) {
        (Some(name), _) => name.clone(),
        (None, Some(name)) => name.clone(),
        (None, None) => {
            return Err(syn::Error::new_spanned(
                &self_ty,
                "cannot derive a class name from this type; use #[foreign(name = \"...\")]",
            ));
        }
    };

    let mut constructors = Vec::new();
    let mut methods = Vec::new();

    for item in &mut input.items {
        let ImplItem::Fn(function) = item else {
            continue;
        };
        let member = MemberAttrs::from_attrs(&function.attrs)?;
        strip_helper_attrs(&mut function.attrs);
        if member.ignore || !is_exposable(function) {
            continue;
        }
        let Some(params) = supported_params(function) else {
            continue;
        };

        let is_instance = function.sig.receiver().is_some();
        if !is_instance && returns_self(&function.sig.output, type_name.as_deref()) {
            constructors.push(constructor_meta(function, &params));
        } else if supported_return(&function.sig.output) {
            methods.push(method_meta(function, &params, is_instance, member.name.as_deref()));
        }
    }

    Ok(quote! {
        #input

        impl ::wren::binder::ForeignClass for #self_ty {
            const CLASS_NAME: &'static str = #class_name;

            fn constructors() -> ::std::vec::Vec<::wren::binder::ConstructorMeta<Self>> {
                ::std::vec![#(#constructors),*]
            }

            fn methods() -> ::std::vec::Vec<::wren::binder::MethodMeta<Self>> {
                ::std::vec![#(#methods),*]
            }
        }
    })
}

/// One parameter after the receiver.
struct Param {
    name: String,
    ty: Type,
}

/// `pub`, synchronous, safe, non-generic, and taking `self` by reference if
/// at all.
fn is_exposable(function: &ImplItemFn) -> bool {
    let sig = &function.sig;
    let by_reference = match sig.receiver() {
        Some(receiver) => receiver.reference.is_some(),
        None => true,
    };
    matches!(function.vis, Visibility::Public(_))
        && sig.asyncness.is_none()
        && sig.unsafety.is_none()
        && sig.generics.params.is_empty()
        && sig.variadic.is_none()
        && by_reference
}

/// The non-receiver parameters, or `None` if any has a type the binder cannot
/// coerce.
fn supported_params(function: &ImplItemFn) -> Option<Vec<Param>> {
    let mut params = Vec::new();
    for (index, arg) in function.sig.inputs.iter().enumerate() {
        let FnArg::Typed(pat_type) = arg else {
            continue;
        };
        if !is_supported(&pat_type.ty) {
            return None;
        }
        let name = match pat_type.pat.as_ref() {
            Pat::Ident(ident) => ident.ident.to_string(),
            _ => format!("arg{index}"),
        };
        params.push(Param {
            name,
            ty: (*pat_type.ty).clone(),
        });
    }
    Some(params)
}

fn last_ident(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) if path.qself.is_none() => {
            path.path.segments.last().map(|segment| segment.ident.to_string())
        }
        _ => None,
    }
}

fn is_supported(ty: &Type) -> bool {
    last_ident(ty).is_some_and(|name| SUPPORTED.contains(&name.as_str()))
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

fn returns_self(output: &ReturnType, type_name: Option<&str>) -> bool {
    let ReturnType::Type(_, ty) = output else {
        return false;
    };
    match last_ident(ty) {
        Some(name) => name == "Self" || Some(name.as_str()) == type_name,
        None => false,
    }
}

/// `()`, a supported kind, or `Result` of either.
fn supported_return(output: &ReturnType) -> bool {
    let ReturnType::Type(_, ty) = output else {
        return true;
    };
    if is_unit(ty) || is_supported(ty) {
        return true;
    }
    let Type::Path(path) = ty.as_ref() else {
        return false;
    };
    let Some(segment) = path.path.segments.last() else {
        return false;
    };
    if segment.ident != "Result" {
        return false;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return false;
    };
    matches!(
        args.args.first(),
        Some(GenericArgument::Type(ok)) if is_unit(ok) || is_supported(ok)
    )
}

fn param_tokens(params: &[Param]) -> (Vec<TokenStream2>, Vec<TokenStream2>, Vec<syn::Ident>) {
    let metas = params
        .iter()
        .map(|param| {
            let name = &param.name;
            let ty = &param.ty;
            quote! { ::wren::binder::ParamMeta::of::<#ty>(#name) }
        })
        .collect();
    let idents: Vec<syn::Ident> = (0..params.len()).map(|i| format_ident!("__arg{}", i)).collect();
    let takes = params
        .iter()
        .zip(&idents)
        .map(|(param, ident)| {
            let ty = &param.ty;
            quote! { let #ident: #ty = __args.take()?; }
        })
        .collect();
    (metas, takes, idents)
}

fn args_binding(params: &[Param]) -> TokenStream2 {
    if params.is_empty() {
        quote! { _ }
    } else {
        quote! { __args }
    }
}

fn constructor_meta(function: &ImplItemFn, params: &[Param]) -> TokenStream2 {
    let fn_name = &function.sig.ident;
    let (metas, takes, idents) = param_tokens(params);
    let args = args_binding(params);

    quote! {
        ::wren::binder::ConstructorMeta::<Self> {
            params: ::std::vec![#(#metas),*],
            construct: |#args: &mut ::wren::binder::Args| {
                #(#takes)*
                ::core::result::Result::Ok(Self::#fn_name(#(#idents),*))
            },
        }
    }
}

fn method_meta(
    function: &ImplItemFn,
    params: &[Param],
    is_instance: bool,
    script_name: Option<&str>,
) -> TokenStream2 {
    let fn_name = &function.sig.ident;
    let name = fn_name.to_string();
    let (metas, takes, idents) = param_tokens(params);
    let args = args_binding(params);
    let script_name = match script_name {
        Some(script_name) => quote! { ::core::option::Option::Some(#script_name) },
        None => quote! { ::core::option::Option::None },
    };

    let invoke = if is_instance {
        quote! {
            ::wren::binder::Invoke::<Self>::Instance(
                |__this: &mut Self, #args: &mut ::wren::binder::Args| {
                    #(#takes)*
                    ::wren::binder::IntoReturn::into_return(__this.#fn_name(#(#idents),*))
                }
            )
        }
    } else {
        quote! {
            ::wren::binder::Invoke::<Self>::Static(
                |#args: &mut ::wren::binder::Args| {
                    #(#takes)*
                    ::wren::binder::IntoReturn::into_return(Self::#fn_name(#(#idents),*))
                }
            )
        }
    };

    quote! {
        ::wren::binder::MethodMeta::<Self> {
            name: #name,
            script_name: #script_name,
            params: ::std::vec![#(#metas),*],
            invoke: #invoke,
        }
    }
}
