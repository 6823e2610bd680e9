// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use bitflags::bitflags;
use cryptoki_sys::{
    CK_FLAGS, CK_SESSION_HANDLE, CK_STATE, CK_USER_TYPE, CKF_RW_SESSION, CKF_SERIAL_SESSION,
    CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS, CKS_RW_PUBLIC_SESSION, CKS_RW_SO_FUNCTIONS,
    CKS_RW_USER_FUNCTIONS, CKU_SO, CKU_USER,
};
use strum::IntoEnumIterator;
use strum_macros::Display;
use tracing::{debug, info, trace, warn};

use crate::{
    TokenError, TokenResult,
    config::TokenConfig,
    core::{
        mechanism::{MechanismInfo, MechanismType},
        object::ObjectHandle,
    },
    objects_store::ObjectsStore,
    openssl::OpensslBackend,
    sessions::Session,
    traits::CryptoBackend,
};

// "Valid session handles in Cryptoki always have nonzero values."
#[cfg(not(target_os = "windows"))]
type HandleCounter = std::sync::atomic::AtomicU64;
#[cfg(target_os = "windows")]
type HandleCounter = std::sync::atomic::AtomicU32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: CK_FLAGS {
        const RW_SESSION = CKF_RW_SESSION;
        const SERIAL_SESSION = CKF_SERIAL_SESSION;
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    SecurityOfficer,
    User,
}

impl TryFrom<CK_USER_TYPE> for UserType {
    type Error = TokenError;

    fn try_from(user_type: CK_USER_TYPE) -> TokenResult<Self> {
        match user_type {
            CKU_SO => Ok(Self::SecurityOfficer),
            CKU_USER => Ok(Self::User),
            _ => Err(TokenError::Conversion(format!(
                "unsupported user type: {user_type}"
            ))),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    NotLoggedIn,
    User,
    SecurityOfficer,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    RoPublic,
    RoUser,
    RwPublic,
    RwUser,
    RwSecurityOfficer,
}

impl SessionState {
    pub(crate) const fn new(read_write: bool, login: LoginState) -> Self {
        match (read_write, login) {
            (false, LoginState::NotLoggedIn | LoginState::SecurityOfficer) => Self::RoPublic,
            (false, LoginState::User) => Self::RoUser,
            (true, LoginState::NotLoggedIn) => Self::RwPublic,
            (true, LoginState::User) => Self::RwUser,
            (true, LoginState::SecurityOfficer) => Self::RwSecurityOfficer,
        }
    }
}

impl From<SessionState> for CK_STATE {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::RoPublic => CKS_RO_PUBLIC_SESSION,
            SessionState::RoUser => CKS_RO_USER_FUNCTIONS,
            SessionState::RwPublic => CKS_RW_PUBLIC_SESSION,
            SessionState::RwUser => CKS_RW_USER_FUNCTIONS,
            SessionState::RwSecurityOfficer => CKS_RW_SO_FUNCTIONS,
        }
    }
}

/// `C_GetTokenInfo` data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub max_session_count: usize,
    pub session_count: usize,
    pub min_rsa_modulus_bits: usize,
    pub max_rsa_modulus_bits: usize,
}

/// State shared by a slot and all of its sessions.
pub(crate) struct SlotInner {
    pub(crate) config: TokenConfig,
    pub(crate) backend: Arc<dyn CryptoBackend>,
    pub(crate) token_objects: RwLock<ObjectsStore>,
    next_object_handle: HandleCounter,
    next_session_handle: HandleCounter,
    open_sessions: AtomicUsize,
}

impl SlotInner {
    /// A handle unique across every session of the slot, never reused.
    pub(crate) fn next_object_handle(&self) -> ObjectHandle {
        ObjectHandle::new(self.next_object_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn release_session(&self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One slot holding one software token.
///
/// Cloning is cheap: clones share the token objects and the session count.
#[derive(Clone)]
pub struct Slot {
    inner: Arc<SlotInner>,
}

impl Slot {
    pub fn new(config: TokenConfig, backend: Arc<dyn CryptoBackend>) -> TokenResult<Self> {
        config.validate()?;
        info!(
            "slot {}: token {:?} ({}) initialized",
            config.slot_id, config.label, config.model
        );
        debug!("slot configuration: {config:?}");
        Ok(Self {
            inner: Arc::new(SlotInner {
                config,
                backend,
                token_objects: RwLock::new(ObjectsStore::default()),
                next_object_handle: HandleCounter::new(1),
                next_session_handle: HandleCounter::new(1),
                open_sessions: AtomicUsize::new(0),
            }),
        })
    }

    /// A slot backed by [`OpensslBackend`].
    pub fn with_openssl(config: TokenConfig) -> TokenResult<Self> {
        Self::new(config, Arc::new(OpensslBackend))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.config.slot_id
    }

    pub fn open_session(&self, flags: SessionFlags) -> TokenResult<Session> {
        if !flags.contains(SessionFlags::SERIAL_SESSION) {
            warn!("open_session: CKF_SERIAL_SESSION is not set");
            return Err(TokenError::SessionParallelNotSupported);
        }
        let max = self.inner.config.max_sessions;
        if self.inner.open_sessions.fetch_add(1, Ordering::SeqCst) >= max {
            self.inner.release_session();
            warn!("open_session: the limit of {max} sessions is reached");
            return Err(TokenError::SessionCount(max));
        }
        let handle: CK_SESSION_HANDLE = self.inner.next_session_handle.fetch_add(1, Ordering::Relaxed);
        info!(
            "slot {}: session {handle} opened, read-write: {}",
            self.id(),
            flags.contains(SessionFlags::RW_SESSION)
        );
        Ok(Session::new(handle, Arc::clone(&self.inner), flags))
    }

    #[must_use]
    pub fn info(&self) -> TokenInfo {
        let config = &self.inner.config;
        TokenInfo {
            label: config.label.clone(),
            manufacturer_id: config.manufacturer_id.clone(),
            model: config.model.clone(),
            serial_number: config.serial_number.clone(),
            max_session_count: config.max_sessions,
            session_count: self.session_count(),
            min_rsa_modulus_bits: config.min_rsa_modulus_bits,
            max_rsa_modulus_bits: config.max_rsa_modulus_bits,
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn token_object_count(&self) -> TokenResult<usize> {
        let store = self.inner.token_objects.read()?;
        trace!("token objects of slot {}:\n{store}", self.id());
        Ok(store.len())
    }

    /// `C_GetMechanismList`
    #[must_use]
    pub fn mechanisms(&self) -> Vec<MechanismType> {
        MechanismType::iter().collect()
    }

    /// `C_GetMechanismInfo`
    #[must_use]
    pub fn mechanism_info(&self, mechanism: MechanismType) -> MechanismInfo {
        let config = &self.inner.config;
        mechanism.info(config.min_rsa_modulus_bits, config.max_rsa_modulus_bits)
    }
}
