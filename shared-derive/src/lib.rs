//! Derive macros for fieldless enums that are decoded from register and
//! descriptor fields.
//!
//! `#[derive(U8Enum)]` generates `TryFrom<u8>`, returning
//! `shared::primitive_enum::InvalidValue` for values without a matching
//! discriminant.
extern crate proc_macro;

use paste::paste;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

macro_rules! primitive_enum {
    ($type:ident) => {
        paste! {
        #[proc_macro_derive([<$type:camel Enum>])]
        pub fn [<derive_ $type _enum>](input: TokenStream) -> TokenStream {
            let DeriveInput { ident, data, .. } = parse_macro_input!(input);

            let data = match data {
                syn::Data::Enum(data) => data,
                _ => {
                    return syn::Error::new(
                        ident.span(),
                        concat!(stringify!([<$type:camel Enum>]), " is only allowed on enums"),
                    )
                    .to_compile_error()
                    .into();
                }
            };

            let variants = data.variants.iter().filter_map(|variant| {
                let (_, disc) = variant.discriminant.as_ref()?;
                let var = &variant.ident;
                Some(quote! {
                    #disc => Ok(#ident::#var)
                })
            });

            let output = quote! {
                impl TryFrom<$type> for #ident {
                    type Error = ::shared::primitive_enum::InvalidValue<$type>;

                    fn try_from(value: $type) -> Result<Self, Self::Error> {
                        match value {
                            #(#variants,)*
                            v => Err(::shared::primitive_enum::InvalidValue { value: v }),
                        }
                    }
                }
            };
            output.into()
        }
        }
    };
}

primitive_enum!(u8);
