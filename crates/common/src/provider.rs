use serde::{Deserialize, Serialize};

/// External provider whose webhooks feed the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Card payment processor (payment intents).
    Stripe,
    /// E-signature provider (envelopes).
    #[serde(rename = "docusign")]
    DocuSign,
    /// Billing side of the CRM (invoices, refunds).
    ZohoBilling,
}

impl Provider {
    /// Returns the provider tag used in storage and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::DocuSign => "docusign",
            Provider::ZohoBilling => "zoho_billing",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unrecognized provider tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProvider(pub String);

impl std::fmt::Display for UnknownProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown provider: {}", self.0)
    }
}

impl std::error::Error for UnknownProvider {}

impl std::str::FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Provider::Stripe),
            "docusign" => Ok(Provider::DocuSign),
            "zoho_billing" => Ok(Provider::ZohoBilling),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for provider in [Provider::Stripe, Provider::DocuSign, Provider::ZohoBilling] {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("paypal".parse::<Provider>().is_err());
    }

    #[test]
    fn test_serde_matches_storage_tag() {
        for provider in [Provider::Stripe, Provider::DocuSign, Provider::ZohoBilling] {
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, format!("\"{}\"", provider.as_str()));
        }
    }
}
