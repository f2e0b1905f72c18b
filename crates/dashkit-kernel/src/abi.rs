//! Module ABI
//!
//! A widget module is a `cdylib` exporting two unmangled functions:
//! - `dashkit_abi_version`: `extern "C" fn() -> u32`, must equal [`ABI_VERSION`]
//! - `dashkit_register`: `fn(&mut dyn WidgetRegistrar)`, the self-registration call
//!
//! The registration entry point passes Rust trait objects, so modules must be
//! built with the same toolchain and `dashkit-kernel` version as the host.
//! Use [`export_widgets!`](crate::export_widgets) rather than writing the
//! exports by hand.

use crate::widget::WidgetRegistrar;

/// Current module ABI version.
pub const ABI_VERSION: u32 = 1;

/// Symbol returning the module's ABI version.
pub const ABI_VERSION_SYMBOL: &[u8] = b"dashkit_abi_version";

/// Symbol of the self-registration entry point.
pub const REGISTER_SYMBOL: &[u8] = b"dashkit_register";

/// Signature of [`ABI_VERSION_SYMBOL`].
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// Signature of [`REGISTER_SYMBOL`].
pub type RegisterFn = unsafe fn(&mut dyn WidgetRegistrar);

/// Export widget types from a module.
///
/// ```rust,ignore
/// dashkit_kernel::export_widgets! {
///     "demo.text" => TextWidget,
///     "demo.clock" => ClockWidget,
/// }
/// ```
///
/// Every listed type must implement [`Widget`](crate::Widget) and
/// [`FromEventBus`](crate::FromEventBus).
#[macro_export]
macro_rules! export_widgets {
    ($($type_id:literal => $widget:ty),+ $(,)?) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn dashkit_abi_version() -> u32 {
            $crate::abi::ABI_VERSION
        }

        #[unsafe(no_mangle)]
        pub fn dashkit_register(registrar: &mut dyn $crate::WidgetRegistrar) {
            $(
                registrar.register(
                    $type_id,
                    ::std::sync::Arc::new(|bus: &$crate::EventBus| -> $crate::WidgetResult<::std::boxed::Box<dyn $crate::Widget>> {
                        let widget = <$widget as $crate::FromEventBus>::from_event_bus(bus)?;
                        Ok(::std::boxed::Box::new(widget) as ::std::boxed::Box<dyn $crate::Widget>)
                    }),
                );
            )+
        }
    };
}
