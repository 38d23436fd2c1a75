use aliri_braid::braid;
use std::fmt;

/// Formats a secret as a placeholder, or as a truncated prefix when the
/// alternate flag is set
macro_rules! redacted {
    ($ty:ty, $label:literal, debug_chars = $debug_chars:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }
                f.write_str("\"")?;
                write_prefix(self.as_str(), f, $debug_chars)?;
                f.write_str("\"")
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }
                write_prefix(self.as_str(), f, usize::MAX)
            }
        }
    };
}

/// Writes at most `width` characters (or `default_chars`), the last of which
/// is an ellipsis if the secret was cut short
fn write_prefix(secret: &str, f: &mut fmt::Formatter, default_chars: usize) -> fmt::Result {
    let budget = f.width().unwrap_or(default_chars);
    if budget <= 1 {
        return f.write_str("…");
    }

    match secret.char_indices().nth(budget - 1) {
        Some((cut, _)) => {
            f.write_str(&secret[..cut])?;
            f.write_str("…")
        }
        None => f.write_str(secret),
    }
}

/// The resource or API that a token grants access to
#[braid(serde)]
pub struct Audience;

impl Audience {
    /// The audience of a tenant's management API, `https://{domain}/api/v2/`
    pub fn management_api(domain: &str) -> Self {
        Self::new(format!("https://{}/api/v2/", domain.trim_end_matches('/')))
    }
}

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

redacted!(ClientSecretRef, "CLIENT SECRET", debug_chars = 5);

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef, "ACCESS TOKEN", debug_chars = 15);

/// An OAuth2 ID token
#[braid(serde)]
pub struct IdToken;
