// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields};

/// Implements `Command` for a packed command struct.
///
/// The struct name must match a `MessageId` variant. A field named `channel_number` marks the
/// command as channel scoped so responses are matched against that channel.
#[proc_macro_derive(AntCommand)]
pub fn derive_ant_command(input: TokenStream) -> TokenStream {
    let ast = syn::parse_macro_input!(input as DeriveInput);

    match impl_ant_command(&ast) {
        Ok(gen) => gen.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn channel_accessor(ast: &DeriveInput) -> syn::Result<TokenStream2> {
    let fields = match &ast.data {
        Data::Struct(s) => &s.fields,
        _ => {
            return Err(syn::Error::new_spanned(
                &ast.ident,
                "AntCommand can only be derived for structs",
            ))
        }
    };
    let has_channel = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .any(|f| f.ident.as_ref().is_some_and(|i| i == "channel_number")),
        _ => false,
    };
    if has_channel {
        Ok(quote! { Some(self.channel_number) })
    } else {
        Ok(quote! { None })
    }
}

fn impl_ant_command(ast: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &ast.ident;
    let channel = channel_accessor(ast)?;
    Ok(quote! {
        impl crate::commands::Command for #name {
            fn message_id(&self) -> crate::message::MessageId {
                crate::message::MessageId::#name
            }
            fn channel(&self) -> Option<u8> {
                #channel
            }
            fn encode(&self, buf: &mut [u8]) -> Result<usize, ::packed_struct::PackingError> {
                let len = ::packed_struct::PackedStructSlice::packed_bytes_size(Some(self))?;
                if buf.len() < len {
                    return Err(::packed_struct::PackingError::BufferSizeMismatch {
                        expected: len,
                        actual: buf.len(),
                    });
                }
                ::packed_struct::PackedStructSlice::pack_to_slice(self, &mut buf[..len])?;
                Ok(len)
            }
        }
    })
}
