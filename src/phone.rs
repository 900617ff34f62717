//! Channel identity normalization.
//!
//! WhatsApp hands us phone identities in several spellings: E.164 with a
//! leading `+`, bare digit runs, or full JIDs (`5491122334455@s.whatsapp.net`).
//! Clients are keyed by the normalized form, so both adapters must agree on
//! it. Region quirks (digits the network inserts that the send path must not
//! carry) are expressed as pluggable rules.

/// A single region-specific rewrite. Returns `Some` when the rule applies.
pub trait RegionRule: Send + Sync {
    fn apply(&self, digits: &str) -> Option<String>;
}

/// Argentina: Meta reports mobile numbers as `549` + area + number (13
/// digits), but the Graph API only accepts `54` + area + number. Drop the
/// mobile indicator digit.
pub struct ArgentinaMobile;

impl RegionRule for ArgentinaMobile {
    fn apply(&self, digits: &str) -> Option<String> {
        if digits.starts_with("549") && digits.len() == 13 {
            Some(format!("54{}", &digits[3..]))
        } else {
            None
        }
    }
}

/// Normalizes raw channel identities to a canonical digit string.
pub struct PhoneNormalizer {
    rules: Vec<Box<dyn RegionRule>>,
}

impl PhoneNormalizer {
    pub fn new(rules: Vec<Box<dyn RegionRule>>) -> Self {
        Self { rules }
    }

    /// The default rule set shipped with the platform.
    pub fn with_default_rules() -> Self {
        Self::new(vec![Box::new(ArgentinaMobile)])
    }

    /// Strip JID domain and non-digits, then apply the first matching
    /// region rule.
    pub fn normalize(&self, raw: &str) -> String {
        let user_part = raw.split('@').next().unwrap_or(raw);
        let digits: String = user_part.chars().filter(char::is_ascii_digit).collect();

        for rule in &self.rules {
            if let Some(rewritten) = rule.apply(&digits) {
                return rewritten;
            }
        }
        digits
    }
}

impl Default for PhoneNormalizer {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_plus_prefix() {
        let n = PhoneNormalizer::with_default_rules();
        assert_eq!(n.normalize("+5511987654321"), "5511987654321");
    }

    #[test]
    fn strips_jid_domain() {
        let n = PhoneNormalizer::with_default_rules();
        assert_eq!(n.normalize("5511987654321@s.whatsapp.net"), "5511987654321");
    }

    #[test]
    fn argentina_mobile_indicator_dropped() {
        let n = PhoneNormalizer::with_default_rules();
        assert_eq!(n.normalize("5491125367148"), "541125367148");
    }

    #[test]
    fn argentina_rule_applies_after_jid_strip() {
        let n = PhoneNormalizer::with_default_rules();
        assert_eq!(n.normalize("5491125367148@s.whatsapp.net"), "541125367148");
    }

    #[test]
    fn argentina_landline_untouched() {
        // 12 digits, not the mobile shape; left alone.
        let n = PhoneNormalizer::with_default_rules();
        assert_eq!(n.normalize("541125367148"), "541125367148");
    }

    #[test]
    fn no_rules_means_digits_only() {
        let n = PhoneNormalizer::new(Vec::new());
        assert_eq!(n.normalize("+54 9 11 2536-7148"), "5491125367148");
    }
}
