//! Attribute parsing for `#[foreign]`.

use proc_macro2::TokenStream;
use syn::parse::Parser;
use syn::{Attribute, LitStr};

/// Arguments of `#[foreign(...)]` itself.
#[derive(Debug, Default)]
pub struct ClassAttrs {
    /// Class name the script declares (default: the Rust type name).
    pub name: Option<String>,
}

/// Parsed `#[wren(...)]` attributes on a function.
#[derive(Debug, Default)]
pub struct MemberAttrs {
    /// Leave the function out of the binding.
    pub ignore: bool,
    /// Script-side name, used as written.
    pub name: Option<String>,
}

impl ClassAttrs {
    pub fn parse(args: TokenStream) -> syn::Result<Self> {
        let mut result = Self::default();
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                result.name = Some(value.value());
                Ok(())
            } else {
                Err(meta.error(format!(
                    "unknown foreign attribute: {}",
                    meta.path.get_ident().map(|i| i.to_string()).unwrap_or_default()
                )))
            }
        });
        parser.parse2(args)?;
        Ok(result)
    }
}

impl MemberAttrs {
    pub fn from_attrs(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut result = Self::default();

        for attr in attrs {
            if !attr.path().is_ident("wren") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("ignore") {
                    result.ignore = true;
                } else if meta.path.is_ident("name") {
                    let value: LitStr = meta.value()?.parse()?;
                    if value.value().is_empty() {
                        return Err(syn::Error::new(value.span(), "script name must not be empty"));
                    }
                    result.name = Some(value.value());
                } else {
                    return Err(meta.error(format!(
                        "unknown wren attribute: {}",
                        meta.path.get_ident().map(|i| i.to_string()).unwrap_or_default()
                    )));
                }
                Ok(())
            })?;
        }

        Ok(result)
    }
}

/// Drop `#[wren(...)]` helper attributes, which are not real attributes.
pub fn strip_helper_attrs(attrs: &mut Vec<Attribute>) {
    attrs.retain(|attr| !attr.path().is_ident("wren"));
}
