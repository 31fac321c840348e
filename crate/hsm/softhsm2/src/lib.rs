//! SoftHSMv2 is fully supported by the generic token layer: this crate only
//! knows where the module usually lives and carries the tests run against it.

use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

use cryptoki_mgmt_hsm::{HResult, Token};
use tracing::debug;

/// Path to the SoftHSMv2 `PKCS#11` shared library on Debian-like systems
pub const SOFTHSM2_PKCS11_LIB: &str = "/usr/lib/softhsm/libsofthsm2.so";

/// Environment variable overriding [`SOFTHSM2_PKCS11_LIB`]
pub const SOFTHSM2_PKCS11_LIB_ENV: &str = "SOFTHSM2_PKCS11_LIB";

fn library_path(from_env: Option<OsString>) -> PathBuf {
    from_env
        .filter(|path| !path.is_empty())
        .map_or_else(|| PathBuf::from(SOFTHSM2_PKCS11_LIB), PathBuf::from)
}

/// The SoftHSMv2 module location, from `SOFTHSM2_PKCS11_LIB` when set.
#[must_use]
pub fn softhsm2_library() -> PathBuf {
    library_path(env::var_os(SOFTHSM2_PKCS11_LIB_ENV))
}

/// Load and initialize SoftHSMv2, from `location` or the default location.
pub fn load_softhsm2(location: Option<&Path>) -> HResult<Token> {
    let path = location.map_or_else(softhsm2_library, Path::to_path_buf);
    debug!("loading SoftHSMv2 from {}", path.display());
    Token::load(path)
}


#[cfg(test)]
mod path_tests {
    use std::ffi::OsString;

    use super::{SOFTHSM2_PKCS11_LIB, library_path};

    #[test]
    fn env_overrides_default_location() {
        assert_eq!(library_path(None).to_str(), Some(SOFTHSM2_PKCS11_LIB));
        assert_eq!(
            library_path(Some(OsString::new())).to_str(),
            Some(SOFTHSM2_PKCS11_LIB)
        );
        assert_eq!(
            library_path(Some(OsString::from("/opt/softhsm/lib.so"))).to_str(),
            Some("/opt/softhsm/lib.so")
        );
    }

    #[test]
    fn missing_library_is_reported() {
        let err = super::load_softhsm2(Some("/nonexistent/libsofthsm2.so".as_ref()))
            .err()
            .map(|e| e.to_string());
        assert!(
            err.is_some_and(|e| e.starts_with("Library not found on the current platform")),
        );
    }
}
