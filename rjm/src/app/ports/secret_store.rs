// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::errors::{AppResult, config_error};
use crate::app::types::Credentials;

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const OTP_SEED_KEY: &str = "otp_seed";
pub const LAST_OTP_USED_KEY: &str = "last_otp_used";

pub trait SecretStorePort: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn put(&self, key: &str, value: &str) -> AppResult<()>;
}

impl Credentials {
    pub fn load(store: &dyn SecretStorePort) -> AppResult<Self> {
        let required = |key: &str| -> AppResult<String> {
            store
                .get(key)?
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    config_error(format!(
                        "secret '{key}' is not set; run `rjm configure` first"
                    ))
                })
        };
        Ok(Self {
            username: required(USERNAME_KEY)?,
            password: required(PASSWORD_KEY)?,
            otp_seed: required(OTP_SEED_KEY)?,
        })
    }

    pub fn store(&self, store: &dyn SecretStorePort) -> AppResult<()> {
        store.put(USERNAME_KEY, &self.username)?;
        store.put(PASSWORD_KEY, &self.password)?;
        store.put(OTP_SEED_KEY, &self.otp_seed)
    }
}
