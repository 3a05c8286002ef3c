//! `#[hardmalloc_options(...)]`: bake default allocator options into a
//! binary.
//!
//! ```rust,ignore
//! #[hardmalloc_macros::hardmalloc_options(quarantine_size_kb = 256, zero_contents = true)]
//! fn main() {}
//! ```
//!
//! The attribute expands to a constructor that hands the rendered option
//! string (`quarantine_size_kb=256:zero_contents=true:`) to
//! `hardmalloc::config::register_default_options` before the allocator's
//! own constructor runs. `HARDMALLOC_OPTIONS` still overrides it.

extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenTree};
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Ident, ItemFn, LitStr, Token};

/// One `key = value` pair.
struct OptionPair {
    key: Ident,
    value: String,
}

impl Parse for OptionPair {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let key: Ident = input.parse()?;
        input.parse::<Token![=]>()?;

        let value = match input.parse::<TokenTree>()? {
            TokenTree::Literal(lit) => literal_text(&lit),
            TokenTree::Ident(ident) if ident == "true" || ident == "false" => ident.to_string(),
            TokenTree::Punct(punct) if punct.as_char() == '-' => match input.parse::<TokenTree>()? {
                TokenTree::Literal(lit) => format!("-{}", literal_text(&lit)),
                other => {
                    return Err(syn::Error::new_spanned(other, "expected a literal after `-`"));
                }
            },
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a literal, `true` or `false`",
                ));
            }
        };

        if value.is_empty() || value.contains([':', ',', ' ', '=']) {
            return Err(syn::Error::new_spanned(
                &key,
                "option values may not be empty or contain separators",
            ));
        }
        Ok(Self { key, value })
    }
}

/// String literals are taken without their quotes, everything else as
/// written.
fn literal_text(lit: &proc_macro2::Literal) -> String {
    let text = lit.to_string();
    match syn::parse_str::<LitStr>(&text) {
        Ok(s) => s.value(),
        Err(_) => text,
    }
}

struct OptionList(Punctuated<OptionPair, Token![,]>);

impl Parse for OptionList {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        Ok(Self(Punctuated::parse_terminated(input)?))
    }
}

/// Render pairs in the format `Options::parse` reads.
fn render(pairs: &OptionList) -> String {
    let mut out = String::new();
    for pair in &pairs.0 {
        out.push_str(&pair.key.to_string());
        out.push('=');
        out.push_str(&pair.value);
        out.push(':');
    }
    out
}

#[proc_macro_attribute]
pub fn hardmalloc_options(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as OptionList);
    let function = parse_macro_input!(item as ItemFn);

    if function.sig.ident != "main" {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "#[hardmalloc_options] may only be used on `fn main`",
        )
        .to_compile_error()
        .into();
    }

    let rendered = LitStr::new(&render(&options), Span::call_site());

    TokenStream::from(quote! {
        const _: () = {
            #[used]
            #[cfg_attr(
                any(target_os = "linux", target_os = "android"),
                link_section = ".init_array.00099"
            )]
            #[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
            static REGISTER_DEFAULT_OPTIONS: unsafe extern "C" fn() = {
                unsafe extern "C" fn register() {
                    ::hardmalloc::config::register_default_options(#rendered);
                }
                register
            };
        };

        #function
    })
}
