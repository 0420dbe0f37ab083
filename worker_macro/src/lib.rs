use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use proc_macro_crate::{crate_name, FoundCrate};
use quote::{quote, quote_spanned};
use syn::{parse_macro_input, spanned::Spanned, Ident, Item};

/// Implements `Worker` for a type which has an inherent method
///
/// ```ignore
/// async fn execute(&mut self, ctx: &OperationContext) -> Result<Outcome, WorkerError>
/// ```
///
/// The generated `run` drives the session: it asks for the next operation
/// context, executes the operation and hands the result back for accounting,
/// until the session is stopped or reports a fatal error. Calling the inherent
/// `execute` directly avoids boxing a future per operation, which an
/// `async_trait` method would require.
#[proc_macro_derive(Worker)]
pub fn worker(input: TokenStream) -> TokenStream {
    let item = parse_macro_input!(input as Item);
    let worker_ty = match &item {
        Item::Struct(s) => &s.ident,
        Item::Enum(e) => &e.ident,
        _ => {
            return syn::Error::new(item.span(), "#[derive(Worker)] supports structs and enums")
                .to_compile_error()
                .into()
        }
    };

    let krate = doc_stress_path();
    let run_method = quote_spanned!(item.span()=>
        #[async_trait::async_trait]
        impl #krate::configuration::Worker for #worker_ty {
            async fn run(&mut self, mut session: #krate::run::WorkerSession) -> anyhow::Result<()> {
                while let Some(ctx) = session.start() {
                    let result = self.execute(&ctx).await;
                    session.end(&ctx, result).await?;
                }
                Ok(())
            }
        }
    );
    TokenStream::from(run_method)
}

// Resolves how the deriving crate refers to doc-stress: `crate` from inside
// the library itself, the (possibly renamed) dependency name elsewhere.
fn doc_stress_path() -> TokenStream2 {
    match crate_name("doc-stress") {
        Ok(FoundCrate::Itself) | Err(_) => quote!(crate),
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
    }
}
