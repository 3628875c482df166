//! Types and constants used to talk UEFI variable services.
//!
//! This crate is divided into 2 submodules:
//!
//! - `uefi`: types directly lifted from the official UEFI spec
//! - `varstore`: types specific to the varstore device's guest protocol

#![forbid(unsafe_code)]

/// Define a well-known nvram variable identity.
///
/// Due to the Rust compiler not having built-in support for defining
/// wide-string literals, and me not wanting to yak-shave a proc macro
/// implementation that emits valid UCS-2 slices at compile time, these
/// "constants" are actually methods that can only be called at runtime.
macro_rules! defn_nvram_var {
    ($varname:ident = ($guid:expr, $name:literal)) => {
        #[allow(non_snake_case)]
        pub fn $varname() -> (Guid, &'static ucs2::Ucs2LeSlice) {
            use ucs2::Ucs2LeSlice;
            use zerocopy::IntoBytes;

            (
                $guid,
                Ucs2LeSlice::from_slice_with_nul(wchar::wchz!(u16, $name).as_bytes()).unwrap(),
            )
        }
    };
}

pub mod uefi;
pub mod varstore;
