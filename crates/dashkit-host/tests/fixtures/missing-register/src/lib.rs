//! Module with a valid ABI version but no registration entry point.

use dashkit_kernel::abi::ABI_VERSION;

#[unsafe(no_mangle)]
pub extern "C" fn dashkit_abi_version() -> u32 {
    ABI_VERSION
}
