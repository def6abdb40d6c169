//! Windows interpretation of a composed policy.
//!
//! Builds the primary token the HCS backend hands to
//! `CreateProcessAsUserW`: Default duplicates the current token,
//! Restricted strips privileges with `CreateRestrictedToken`, Strict
//! additionally pins the token to the configured integrity level.
//! AppContainer profiles are created on demand and torn down with the
//! token.

#![allow(unsafe_code)]
#![allow(clippy::undocumented_unsafe_blocks)]

use std::io;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, HLOCAL, LocalFree};
use windows_sys::Win32::Security::Isolation::{
    CreateAppContainerProfile, DeleteAppContainerProfile, DeriveAppContainerSidFromAppContainerName,
};
use windows_sys::Win32::Security::{
    CreateRestrictedToken, DISABLE_MAX_PRIVILEGE, DuplicateTokenEx, FreeSid, PSID,
    SID_AND_ATTRIBUTES, SecurityImpersonation, TOKEN_ALL_ACCESS, TokenPrimary,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use super::{IntegrityLevel, Policy, SecurityLevel, WindowsIsolation};
use crate::{Error, Result};

/// Privileges removed from every container token, by LUID name.
///
/// Matches the engine's hard rule: Debug, LoadDriver, TCB, Security,
/// SystemTime and Shutdown are never available inside a container.
pub const DANGEROUS_PRIVILEGES: &[&str] = &[
    "SeDebugPrivilege",
    "SeLoadDriverPrivilege",
    "SeTcbPrivilege",
    "SeSecurityPrivilege",
    "SeSystemtimePrivilege",
    "SeShutdownPrivilege",
];

/// Integrity level SIDs in SDDL form.
const fn integrity_sid(level: IntegrityLevel) -> &'static str {
    match level {
        IntegrityLevel::Low => "S-1-16-4096",
        IntegrityLevel::Medium => "S-1-16-8192",
        IntegrityLevel::High => "S-1-16-12288",
        IntegrityLevel::System => "S-1-16-16384",
    }
}

/// A fully constructed container token plus its AppContainer state.
///
/// Drop releases everything in reverse order of acquisition.
#[derive(Debug)]
pub struct TokenCtx {
    /// Primary token for `CreateProcessAsUserW`.
    token: HANDLE,
    /// AppContainer SID, when the policy requested one.
    appcontainer_sid: PSID,
    /// Profile name to delete on teardown (empty when derived).
    profile_name: Vec<u16>,
    /// Isolation parameters the backend reads back.
    isolation: WindowsIsolation,
}

impl TokenCtx {
    /// The primary token handle.
    pub fn token(&self) -> HANDLE {
        self.token
    }

    /// The AppContainer SID, null when AppContainer is suppressed.
    pub fn appcontainer_sid(&self) -> PSID {
        self.appcontainer_sid
    }

    /// Isolation parameters derived from the policy.
    pub fn isolation(&self) -> &WindowsIsolation {
        &self.isolation
    }
}

impl Drop for TokenCtx {
    fn drop(&mut self) {
        unsafe {
            if !self.appcontainer_sid.is_null() {
                FreeSid(self.appcontainer_sid);
                if !self.profile_name.is_empty() {
                    DeleteAppContainerProfile(self.profile_name.as_ptr());
                }
            }
            if !self.token.is_null() {
                CloseHandle(self.token);
            }
        }
    }
}

/// Encodes a Rust string as a NUL-terminated UTF-16 buffer.
fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Applies a policy to the current process context, producing the
/// container token.
///
/// Any failure releases the partially built state before returning.
pub fn apply(policy: &Policy, container_id: &str) -> Result<TokenCtx> {
    let isolation = policy.windows_isolation();

    let token = build_token(policy.security_level(), isolation.integrity_level)?;

    let mut ctx = TokenCtx {
        token,
        appcontainer_sid: std::ptr::null_mut(),
        profile_name: Vec::new(),
        isolation,
    };

    if ctx.isolation.use_appcontainer {
        let name = wide(&format!("chef.cvd.{container_id}"));
        let display = wide("chef container");
        let mut sid: PSID = std::ptr::null_mut();
        // Create the profile, or derive the SID when it already exists.
        let hr = unsafe {
            CreateAppContainerProfile(
                name.as_ptr(),
                display.as_ptr(),
                display.as_ptr(),
                std::ptr::null(),
                0,
                &mut sid,
            )
        };
        if hr < 0 {
            let hr2 = unsafe {
                DeriveAppContainerSidFromAppContainerName(name.as_ptr(), &mut sid)
            };
            if hr2 < 0 {
                // ctx drop closes the token.
                return Err(Error::os(
                    "CreateAppContainerProfile",
                    io::Error::from_raw_os_error(hr2),
                ));
            }
        } else {
            ctx.profile_name = name;
        }
        ctx.appcontainer_sid = sid;
    }

    Ok(ctx)
}

/// Builds the primary token for the given security level.
fn build_token(level: SecurityLevel, integrity: IntegrityLevel) -> Result<HANDLE> {
    let mut process_token: HANDLE = std::ptr::null_mut();
    let ok = unsafe {
        OpenProcessToken(GetCurrentProcess(), TOKEN_ALL_ACCESS, &mut process_token)
    };
    if ok == 0 {
        return Err(Error::os("OpenProcessToken", io::Error::last_os_error()));
    }

    let result = match level {
        SecurityLevel::Default => duplicate_primary(process_token),
        SecurityLevel::Restricted => restricted_token(process_token),
        SecurityLevel::Strict => {
            restricted_token(process_token).and_then(|t| set_integrity(t, integrity))
        }
    };

    unsafe { CloseHandle(process_token) };
    result
}

/// Default level: duplicate the current token as a primary token.
fn duplicate_primary(source: HANDLE) -> Result<HANDLE> {
    let mut dup: HANDLE = std::ptr::null_mut();
    let ok = unsafe {
        DuplicateTokenEx(
            source,
            TOKEN_ALL_ACCESS,
            std::ptr::null(),
            SecurityImpersonation,
            TokenPrimary,
            &mut dup,
        )
    };
    if ok == 0 {
        return Err(Error::os("DuplicateTokenEx", io::Error::last_os_error()));
    }
    Ok(dup)
}

/// Restricted level: `CreateRestrictedToken(DISABLE_MAX_PRIVILEGE)` with
/// the Administrators SID added as a restricted SID.
fn restricted_token(source: HANDLE) -> Result<HANDLE> {
    // S-1-5-32-544: BUILTIN\Administrators.
    let admins = administrators_sid()?;
    let restricting = SID_AND_ATTRIBUTES {
        Sid: admins,
        Attributes: 0,
    };

    let mut restricted: HANDLE = std::ptr::null_mut();
    let ok = unsafe {
        CreateRestrictedToken(
            source,
            DISABLE_MAX_PRIVILEGE,
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            1,
            &restricting,
            &mut restricted,
        )
    };
    unsafe { FreeSid(admins) };
    if ok == 0 {
        return Err(Error::os(
            "CreateRestrictedToken",
            io::Error::last_os_error(),
        ));
    }
    Ok(restricted)
}

/// Strict level: pin SE_GROUP_INTEGRITY on the restricted token.
fn set_integrity(token: HANDLE, level: IntegrityLevel) -> Result<HANDLE> {
    use windows_sys::Win32::Security::Authorization::ConvertStringSidToSidW;
    use windows_sys::Win32::Security::{
        SE_GROUP_INTEGRITY, SetTokenInformation, TOKEN_MANDATORY_LABEL, TokenIntegrityLevel,
    };

    let sddl = wide(integrity_sid(level));
    let mut sid: PSID = std::ptr::null_mut();
    if unsafe { ConvertStringSidToSidW(sddl.as_ptr(), &mut sid) } == 0 {
        unsafe { CloseHandle(token) };
        return Err(Error::os(
            "ConvertStringSidToSidW",
            io::Error::last_os_error(),
        ));
    }

    let label = TOKEN_MANDATORY_LABEL {
        Label: SID_AND_ATTRIBUTES {
            Sid: sid,
            Attributes: SE_GROUP_INTEGRITY,
        },
    };
    let ok = unsafe {
        SetTokenInformation(
            token,
            TokenIntegrityLevel,
            std::ptr::addr_of!(label).cast(),
            std::mem::size_of::<TOKEN_MANDATORY_LABEL>() as u32,
        )
    };
    unsafe { LocalFree(sid as HLOCAL) };
    if ok == 0 {
        unsafe { CloseHandle(token) };
        return Err(Error::os("SetTokenInformation", io::Error::last_os_error()));
    }
    Ok(token)
}

/// Allocates the BUILTIN\Administrators SID.
fn administrators_sid() -> Result<PSID> {
    use windows_sys::Win32::Security::{
        AllocateAndInitializeSid, DOMAIN_ALIAS_RID_ADMINS, SECURITY_BUILTIN_DOMAIN_RID,
        SECURITY_NT_AUTHORITY, SID_IDENTIFIER_AUTHORITY,
    };

    let authority = SID_IDENTIFIER_AUTHORITY {
        Value: SECURITY_NT_AUTHORITY,
    };
    let mut sid: PSID = std::ptr::null_mut();
    let ok = unsafe {
        AllocateAndInitializeSid(
            &authority,
            2,
            SECURITY_BUILTIN_DOMAIN_RID as u32,
            DOMAIN_ALIAS_RID_ADMINS as u32,
            0,
            0,
            0,
            0,
            0,
            0,
            &mut sid,
        )
    };
    if ok == 0 {
        return Err(Error::os(
            "AllocateAndInitializeSid",
            io::Error::last_os_error(),
        ));
    }
    Ok(sid)
}
