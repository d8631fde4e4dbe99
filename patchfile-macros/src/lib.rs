use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

use proc_macro::TokenStream;

/// Derive `WireWrite` for a flat wire-header struct by emitting each
/// field in declaration order.
#[proc_macro_derive(ToWire)]
pub fn derive_to_wire(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields: Vec<syn::Member> = match input.data {
        Data::Struct(ref s) => match s.fields {
            Fields::Named(ref nf) => nf
                .named
                .iter()
                .map(|f| f.ident.clone().unwrap().into())
                .collect(),
            Fields::Unnamed(ref uf) => uf
                .unnamed
                .iter()
                .enumerate()
                .map(|(i, _)| syn::Index::from(i).into())
                .collect(),
            Fields::Unit => Vec::new(),
        },
        _ => unreachable!("ToWire can only be derived for structs"),
    };

    let expanded = quote! {
        impl crate::sli::layout::WireWrite for #name {
            fn put(&self, out: &mut Vec<u8>) {
                #( crate::sli::layout::WireWrite::put(&self.#fields, out); )*
            }
        }
    };

    TokenStream::from(expanded)
}
