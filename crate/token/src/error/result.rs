// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::fmt::Display;

use crate::error::TokenError;

pub type TokenResult<R> = Result<R, TokenError>;

pub trait TokenResultHelper<T> {
    fn context(self, context: &str) -> TokenResult<T>;
    fn with_context<D, O>(self, op: O) -> TokenResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D;
}

impl<T> TokenResultHelper<T> for TokenResult<T> {
    fn context(self, context: &str) -> TokenResult<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<D, O>(self, op: O) -> TokenResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.map_err(|e| e.context(&op().to_string()))
    }
}

impl<T> TokenResultHelper<T> for Option<T> {
    fn context(self, context: &str) -> TokenResult<T> {
        self.ok_or_else(|| TokenError::Default(context.to_owned()))
    }

    fn with_context<D, O>(self, op: O) -> TokenResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.ok_or_else(|| TokenError::Default(format!("{}", op())))
    }
}
