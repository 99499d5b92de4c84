use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{ItemFn, LitStr, parse_macro_input};

/// Exports a function through the C ABI and registers it with the loader's
/// internal symbol table.
///
/// This attribute macro:
/// 1. Renames `fn foo` to `fn memdyld_foo`
/// 2. Adds `#[unsafe(no_mangle)]` and `extern "C"`
/// 3. Registers the Darwin symbol name `_foo` (or the name given as the
///    attribute argument) so that images importing it bind to this function
///
/// # Example
///
/// ```ignore
/// #[dyld_export]
/// pub fn dlopen(path: *const libc::c_char, mode: libc::c_int) -> *mut libc::c_void {
///     // implementation
/// }
///
/// #[dyld_export("dyld_stub_binder")]
/// fn stub_binder() {}
/// ```
///
/// The first item expands to:
///
/// ```ignore
/// #[unsafe(no_mangle)]
/// pub extern "C" fn memdyld_dlopen(path: *const libc::c_char, mode: libc::c_int) -> *mut libc::c_void {
///     // implementation
/// }
///
/// #[linkme::distributed_slice(crate::symbols::INTERNAL_EXPORTS)]
/// static _MEMDYLD_SYM_DLOPEN: crate::symbols::InternalExport = crate::symbols::InternalExport {
///     import_name: "_dlopen",
///     code: crate::symbols::CodeAddress(memdyld_dlopen as *const ()),
/// };
/// ```
#[proc_macro_attribute]
pub fn dyld_export(attr: TokenStream, item: TokenStream) -> TokenStream {
    let symbol_name = if attr.is_empty() {
        None
    } else {
        Some(parse_macro_input!(attr as LitStr).value())
    };
    let input = parse_macro_input!(item as ItemFn);

    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let attrs = &input.attrs;

    let original_name = &sig.ident;
    let exported_name = format_ident!("memdyld_{}", original_name);
    let symbol_name = symbol_name.unwrap_or_else(|| format!("_{}", original_name));
    let static_name = format_ident!(
        "_MEMDYLD_SYM_{}",
        original_name.to_string().to_uppercase()
    );

    let inputs = &sig.inputs;
    let output = &sig.output;

    let expanded = quote! {
        #(#attrs)*
        #[unsafe(no_mangle)]
        #vis extern "C" fn #exported_name(#inputs) #output #block

        #[linkme::distributed_slice(crate::symbols::INTERNAL_EXPORTS)]
        static #static_name: crate::symbols::InternalExport = crate::symbols::InternalExport {
            import_name: #symbol_name,
            code: crate::symbols::CodeAddress(#exported_name as *const ()),
        };
    };

    TokenStream::from(expanded)
}
