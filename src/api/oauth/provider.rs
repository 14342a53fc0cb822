//! Vendor authorization URL.

use crate::config::VendorConfig;

/// Build authorization URL with state and redirect_uri
pub fn authorization_url(vendor: &VendorConfig, state: &str, redirect_uri: &str) -> String {
    let scopes = vendor.scopes.join(" ");
    let separator = if vendor.auth_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
        vendor.auth_url,
        separator,
        urlencoding::encode(&vendor.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(state)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor() -> VendorConfig {
        VendorConfig {
            auth_url: "https://example.com/oauth/authorize".to_string(),
            token_url: "https://example.com/oauth/token".to_string(),
            scopes: vec!["users:read".to_string(), "users:write".to_string()],
            client_id: "test_client_id".to_string(),
            ..VendorConfig::default()
        }
    }

    #[test]
    fn test_authorization_url() {
        let url = authorization_url(&vendor(), "random_state", "http://localhost:3000/oauth/callback");

        assert!(url.starts_with("https://example.com/oauth/authorize?"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Foauth%2Fcallback"));
        // URL encoding converts spaces to %20
        assert!(url.contains("scope=users%3Aread%20users%3Awrite"));
        assert!(url.contains("state=random_state"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn test_existing_query_string() {
        let mut vendor = vendor();
        vendor.auth_url = "https://example.com/authorize?audience=api".to_string();
        let url = authorization_url(&vendor, "s", "http://cb");
        assert!(url.starts_with("https://example.com/authorize?audience=api&client_id="));
    }
}
