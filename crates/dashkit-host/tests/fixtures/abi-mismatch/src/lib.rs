//! Module claiming an ABI version the host does not speak.

use dashkit_kernel::WidgetRegistrar;
use dashkit_kernel::abi::ABI_VERSION;

#[unsafe(no_mangle)]
pub extern "C" fn dashkit_abi_version() -> u32 {
    ABI_VERSION + 1
}

#[unsafe(no_mangle)]
pub fn dashkit_register(_registrar: &mut dyn WidgetRegistrar) {}
