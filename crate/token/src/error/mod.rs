// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::{num::TryFromIntError, sync::PoisonError};

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_MECHANISM_TYPE, CK_RV, CKR_ATTRIBUTE_READ_ONLY, CKR_ATTRIBUTE_SENSITIVE,
    CKR_ATTRIBUTE_TYPE_INVALID, CKR_ATTRIBUTE_VALUE_INVALID, CKR_DATA_LEN_RANGE,
    CKR_FUNCTION_FAILED, CKR_GENERAL_ERROR, CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_SIZE_RANGE,
    CKR_KEY_UNEXTRACTABLE, CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID,
    CKR_OBJECT_HANDLE_INVALID, CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED,
    CKR_PIN_INCORRECT, CKR_SESSION_COUNT, CKR_SESSION_PARALLEL_NOT_SUPPORTED,
    CKR_SESSION_READ_ONLY, CKR_SIGNATURE_LEN_RANGE, CKR_TEMPLATE_INCOMPLETE,
    CKR_TEMPLATE_INCONSISTENT, CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};
use thiserror::Error;

use crate::core::{attribute::AttributeType, object::ObjectHandle};

pub(crate) mod result;
pub use result::{TokenResult, TokenResultHelper};

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token error: {0}")]
    Default(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TokenError>,
    },

    // Object and attribute errors.
    #[error("object handle {0} is invalid")]
    InvalidHandle(ObjectHandle),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("{0} is not a valid attribute type")]
    AttributeTypeInvalid(CK_ATTRIBUTE_TYPE),
    #[error("template incomplete: {0}")]
    TemplateIncomplete(String),
    #[error("attribute conflict: {0}")]
    AttributeConflict(String),
    #[error("the value for attribute {0} is invalid: {1}")]
    AttributeValueInvalid(AttributeType, String),
    #[error("attribute {0} is read only")]
    AttributeReadOnly(AttributeType),
    #[error("attribute {0} is sensitive and cannot be revealed")]
    SensitiveAttributeDenied(AttributeType),

    // Authentication errors.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("the PIN is incorrect")]
    PinIncorrect,
    #[error("a user is already logged in")]
    UserAlreadyLoggedIn,

    // Mechanism and key policy errors.
    #[error("invalid mechanism: {0}")]
    MechanismInvalid(String),
    #[error("{0} is not a valid mechanism")]
    MechanismTypeInvalid(CK_MECHANISM_TYPE),
    #[error("mechanism parameter mismatch: {0}")]
    MechanismParameterMismatch(String),
    #[error("key function not permitted: {0}")]
    KeyFunctionNotPermitted(String),
    #[error("key {0} is not extractable")]
    KeyNotExtractable(ObjectHandle),
    #[error("key size out of range: {0}")]
    KeySizeRange(String),

    // Operation errors.
    #[error("operation in progress: {0}")]
    OperationInProgress(String),
    #[error("operation has not been initialized: {0}")]
    OperationNotInitialized(String),
    #[error("data length is invalid: {0}")]
    DataLengthInvalid(String),
    #[error("signature length is invalid: expected {expected} bytes, got {actual}")]
    SignatureLengthInvalid { expected: usize, actual: usize },

    // Session errors.
    #[error("session is read only")]
    SessionReadOnly,
    #[error("token does not support parallel sessions")]
    SessionParallelNotSupported,
    #[error("too many sessions open: the limit is {0}")]
    SessionCount(usize),

    // Catch-all for crypto backend errors.
    #[error("crypto backend failure: {0}")]
    BackendFailure(String),

    // Other errors.
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("object store lock poisoned: {0}")]
    StoreLock(String),
}

impl TokenError {
    /// Wrap this error with a higher level context; the `CK_RV` of the source is kept.
    #[must_use]
    pub fn context(self, context: &str) -> Self {
        Self::Context {
            context: context.to_owned(),
            source: Box::new(self),
        }
    }
}

impl From<::openssl::error::ErrorStack> for TokenError {
    fn from(e: ::openssl::error::ErrorStack) -> Self {
        Self::BackendFailure(format!("OpenSSL error: {e}"))
    }
}

impl From<TryFromIntError> for TokenError {
    fn from(e: TryFromIntError) -> Self {
        Self::Conversion(e.to_string())
    }
}

impl From<toml::de::Error> for TokenError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl<T> From<PoisonError<T>> for TokenError {
    fn from(e: PoisonError<T>) -> Self {
        Self::StoreLock(e.to_string())
    }
}

impl From<TokenError> for CK_RV {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Context { source, .. } => (*source).into(),
            TokenError::InvalidHandle(_) => CKR_OBJECT_HANDLE_INVALID,
            TokenError::InvalidAttribute(_) | TokenError::AttributeTypeInvalid(_) => {
                CKR_ATTRIBUTE_TYPE_INVALID
            }
            TokenError::TemplateIncomplete(_) => CKR_TEMPLATE_INCOMPLETE,
            TokenError::AttributeConflict(_) => CKR_TEMPLATE_INCONSISTENT,
            TokenError::AttributeValueInvalid(..) => CKR_ATTRIBUTE_VALUE_INVALID,
            TokenError::AttributeReadOnly(_) => CKR_ATTRIBUTE_READ_ONLY,
            TokenError::SensitiveAttributeDenied(_) => CKR_ATTRIBUTE_SENSITIVE,
            TokenError::PermissionDenied(_) => CKR_USER_NOT_LOGGED_IN,
            TokenError::PinIncorrect => CKR_PIN_INCORRECT,
            TokenError::UserAlreadyLoggedIn => CKR_USER_ALREADY_LOGGED_IN,
            TokenError::MechanismInvalid(_) | TokenError::MechanismTypeInvalid(_) => {
                CKR_MECHANISM_INVALID
            }
            TokenError::MechanismParameterMismatch(_) => CKR_MECHANISM_PARAM_INVALID,
            TokenError::KeyFunctionNotPermitted(_) => CKR_KEY_FUNCTION_NOT_PERMITTED,
            TokenError::KeyNotExtractable(_) => CKR_KEY_UNEXTRACTABLE,
            TokenError::KeySizeRange(_) => CKR_KEY_SIZE_RANGE,
            TokenError::OperationInProgress(_) => CKR_OPERATION_ACTIVE,
            TokenError::OperationNotInitialized(_) => CKR_OPERATION_NOT_INITIALIZED,
            TokenError::DataLengthInvalid(_) => CKR_DATA_LEN_RANGE,
            TokenError::SignatureLengthInvalid { .. } => CKR_SIGNATURE_LEN_RANGE,
            TokenError::SessionReadOnly => CKR_SESSION_READ_ONLY,
            TokenError::SessionParallelNotSupported => CKR_SESSION_PARALLEL_NOT_SUPPORTED,
            TokenError::SessionCount(_) => CKR_SESSION_COUNT,
            TokenError::BackendFailure(_) => CKR_FUNCTION_FAILED,
            TokenError::Default(_)
            | TokenError::Conversion(_)
            | TokenError::Config(_)
            | TokenError::Io(_)
            | TokenError::StoreLock(_) => CKR_GENERAL_ERROR,
        }
    }
}

/// Return early with an error if a condition is not satisfied.
///
/// This macro is equivalent to `if !$cond { return Err(From::from($err)); }`.
#[macro_export]
macro_rules! token_ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($crate::token_error!($msg));
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !$cond {
            return ::core::result::Result::Err($crate::token_error!($fmt, $($arg)*));
        }
    };
}

/// Construct a token error from a string.
#[macro_export]
macro_rules! token_error {
    ($msg:literal) => {
        $crate::TokenError::Default(::core::format_args!($msg).to_string())
    };
    ($err:expr $(,)?) => ({
        $crate::TokenError::Default($err.to_string())
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::TokenError::Default(::core::format_args!($fmt, $($arg)*).to_string())
    };
}

/// Return early with an error if a condition is not satisfied.
#[macro_export]
macro_rules! token_bail {
    ($msg:literal) => {
        return ::core::result::Result::Err($crate::token_error!($msg))
    };
    ($err:expr $(,)?) => {
        return ::core::result::Result::Err($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        return ::core::result::Result::Err($crate::token_error!($fmt, $($arg)*))
    };
}

#[expect(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use cryptoki_sys::{CK_RV, CKR_ATTRIBUTE_SENSITIVE, CKR_OPERATION_ACTIVE};

    use super::TokenError;
    use crate::core::attribute::AttributeType;

    #[test]
    fn test_token_error_interpolation() {
        let var = 42;
        let err = token_error!("interpolate {var}");
        assert_eq!("token error: interpolate 42", err.to_string());

        let err = bail();
        assert_eq!("token error: interpolate 43", err.unwrap_err().to_string());

        let err = ensure();
        assert_eq!("token error: interpolate 44", err.unwrap_err().to_string());
    }

    #[test]
    fn test_context_keeps_return_value() {
        let err = TokenError::OperationInProgress("sign".to_owned()).context("C_SignInit");
        assert_eq!(
            "C_SignInit: operation in progress: sign",
            err.to_string()
        );
        assert_eq!(CK_RV::from(err), CKR_OPERATION_ACTIVE);

        let rv: CK_RV = TokenError::SensitiveAttributeDenied(AttributeType::Value).into();
        assert_eq!(rv, CKR_ATTRIBUTE_SENSITIVE);
    }

    fn bail() -> Result<(), TokenError> {
        let var = 43;
        token_bail!("interpolate {var}");
    }

    fn ensure() -> Result<(), TokenError> {
        let var = 44;
        token_ensure!(false, "interpolate {var}");
        Ok(())
    }
}
