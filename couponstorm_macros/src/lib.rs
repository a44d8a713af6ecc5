use proc_macro::TokenStream;
use quote::quote;
use syn::{Item, parse_macro_input};

extern crate proc_macro;

/// Marks a struct or enum as part of a run report.
///
/// Adds the serde and comparison derives every report type needs and implements the
/// `Report` marker trait, which must be in scope at the call site.
#[proc_macro_attribute]
pub fn report(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as Item);
    let ident = match &ast {
        Item::Struct(s) => &s.ident,
        Item::Enum(e) => &e.ident,
        other => {
            return syn::Error::new_spanned(other, "#[report] only applies to structs and enums")
                .to_compile_error()
                .into();
        }
    };

    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl Report for #ident {}
    };

    TokenStream::from(expanded)
}
