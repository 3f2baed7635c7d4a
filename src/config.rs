// src/config.rs
use std::env;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "sandbox" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            other => Err(AppError::configuration(format!(
                "MPESA_ENVIRONMENT must be 'sandbox' or 'production', got '{}'",
                other
            ))),
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Sandbox => SANDBOX_BASE_URL,
            Environment::Production => PRODUCTION_BASE_URL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Paybill,
    Till,
}

impl AccountType {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "paybill" => Ok(AccountType::Paybill),
            "till" => Ok(AccountType::Till),
            other => Err(AppError::configuration(format!(
                "MPESA_ACCOUNT_TYPE must be 'paybill' or 'till', got '{}'",
                other
            ))),
        }
    }

    /// Daraja TransactionType code for STK push requests.
    pub fn transaction_type(&self) -> &'static str {
        match self {
            AccountType::Paybill => "CustomerPayBillOnline",
            AccountType::Till => "CustomerBuyGoodsOnline",
        }
    }
}

/// Policy applied when an OAuth refresh fails but an expired token is still
/// cached. `ReuseCached` trades correctness for availability during provider
/// outages or edge-proxy blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFallbackPolicy {
    ReuseCached,
    Fail,
}

impl TokenFallbackPolicy {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "reuse_cached" => Ok(TokenFallbackPolicy::ReuseCached),
            "fail" => Ok(TokenFallbackPolicy::Fail),
            other => Err(AppError::configuration(format!(
                "MPESA_TOKEN_FALLBACK must be 'reuse_cached' or 'fail', got '{}'",
                other
            ))),
        }
    }
}

/// Resolved gateway endpoint URLs for one environment.
#[derive(Debug, Clone)]
pub struct GatewayEndpoints {
    pub oauth: String,
    pub stk_push: String,
    pub stk_query: String,
    pub c2b_register: String,
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub tenant_id: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    pub environment: Environment,
    pub account_type: AccountType,
    pub token_fallback: TokenFallbackPolicy,
}

impl MpesaConfig {
    pub fn from_env() -> Result<Self> {
        let consumer_key = required_var("MPESA_CONSUMER_KEY")?;
        let consumer_secret = required_var("MPESA_CONSUMER_SECRET")?;
        let shortcode = required_var("MPESA_SHORTCODE")?;
        let passkey = required_var("MPESA_PASSKEY")?;
        let callback_url = required_var("MPESA_CALLBACK_URL")?;

        let environment = Environment::parse(
            &env::var("MPESA_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string()),
        )?;
        let account_type = AccountType::parse(
            &env::var("MPESA_ACCOUNT_TYPE").unwrap_or_else(|_| "paybill".to_string()),
        )?;
        let token_fallback = TokenFallbackPolicy::parse(
            &env::var("MPESA_TOKEN_FALLBACK").unwrap_or_else(|_| "reuse_cached".to_string()),
        )?;

        let tenant_id = env::var("MPESA_TENANT_ID").unwrap_or_else(|_| shortcode.clone());

        Ok(MpesaConfig {
            tenant_id,
            consumer_key,
            consumer_secret,
            shortcode,
            passkey,
            callback_url,
            environment,
            account_type,
            token_fallback,
        })
    }

    /// Every outbound gateway call requires the full credential set.
    pub fn require_credentials(&self) -> Result<()> {
        if self.consumer_key.is_empty()
            || self.consumer_secret.is_empty()
            || self.shortcode.is_empty()
            || self.passkey.is_empty()
        {
            return Err(AppError::configuration(
                "M-Pesa credentials not configured",
            ));
        }
        Ok(())
    }

    pub fn endpoints(&self) -> GatewayEndpoints {
        let base_url = self.environment.base_url();
        GatewayEndpoints {
            oauth: format!("{}/oauth/v1/generate?grant_type=client_credentials", base_url),
            stk_push: format!("{}/mpesa/stkpush/v1/processrequest", base_url),
            stk_query: format!("{}/mpesa/stkpushquery/v1/query", base_url),
            c2b_register: format!("{}/mpesa/c2b/v1/registerurl", base_url),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    let value = env::var(name)
        .map_err(|_| AppError::configuration(format!("{} must be set", name)))?;
    if value.trim().is_empty() {
        return Err(AppError::configuration(format!("{} must not be empty", name)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(environment: Environment, account_type: AccountType) -> MpesaConfig {
        MpesaConfig {
            tenant_id: "174379".to_string(),
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            shortcode: "174379".to_string(),
            passkey: "passkey".to_string(),
            callback_url: "https://pos.example.com/mpesa/callback".to_string(),
            environment,
            account_type,
            token_fallback: TokenFallbackPolicy::ReuseCached,
        }
    }

    #[test]
    fn sandbox_and_production_endpoints_differ() {
        let sandbox = test_config(Environment::Sandbox, AccountType::Paybill).endpoints();
        let production = test_config(Environment::Production, AccountType::Paybill).endpoints();

        assert!(sandbox.oauth.starts_with("https://sandbox.safaricom.co.ke/oauth"));
        assert!(production.stk_push.starts_with("https://api.safaricom.co.ke/mpesa/stkpush"));
        assert!(sandbox.stk_query.ends_with("/mpesa/stkpushquery/v1/query"));
        assert!(production.c2b_register.ends_with("/mpesa/c2b/v1/registerurl"));
    }

    #[test]
    fn transaction_type_follows_account_type() {
        assert_eq!(AccountType::Paybill.transaction_type(), "CustomerPayBillOnline");
        assert_eq!(AccountType::Till.transaction_type(), "CustomerBuyGoodsOnline");
    }

    #[test]
    fn empty_credentials_are_rejected() {
        let mut config = test_config(Environment::Sandbox, AccountType::Paybill);
        config.passkey = String::new();
        assert!(matches!(
            config.require_credentials(),
            Err(AppError::Configuration(_))
        ));
    }
}
