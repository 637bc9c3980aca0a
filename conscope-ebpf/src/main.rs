#![no_std]
#![no_main]

use conscope_common::CommonConfig;

mod probes;

/// Written by userspace through `EbpfLoader::set_global` before load.
#[unsafe(no_mangle)]
static CONFIG: CommonConfig = CommonConfig::DEFAULT;

/// The global lives in `.rodata`; the volatile read stops the compiler from
/// folding in the default value.
#[inline(always)]
pub(crate) fn config() -> CommonConfig {
    unsafe { core::ptr::read_volatile(&CONFIG) }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
