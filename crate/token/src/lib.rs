// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

//! A software PKCS#11 token: one slot, sessions, attribute-carrying key objects
//! and streaming cryptographic operations.
//!
//! Keys are only ever referred to by [`ObjectHandle`]. Their attributes carry the
//! policy (sensitivity, extractability, permitted usages) which every session
//! operation checks before any data reaches the [`CryptoBackend`].

pub mod config;
pub mod core;
mod error;
pub mod logging;
mod objects_store;
pub mod openssl;
pub mod operation;
pub mod sessions;
pub mod slots;
pub mod traits;

pub use error::{TokenError, TokenResult, TokenResultHelper};

pub use crate::{
    config::TokenConfig,
    core::{
        attribute::{Attribute, AttributeSet, AttributeType, KeyType, ObjectClass},
        mechanism::{Mechanism, MechanismInfo, MechanismType},
        object::{CryptoObject, ObjectHandle},
    },
    openssl::OpensslBackend,
    operation::{OperationKind, OperationState, Payload},
    sessions::{Session, SessionInfo},
    slots::{LoginState, SessionFlags, SessionState, Slot, TokenInfo, UserType},
    traits::CryptoBackend,
};
