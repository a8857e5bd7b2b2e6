use anyhow::Context;
use rustc_hash::FxHashMap;
use crate::packet::PacketCategory;

/// The per-category drip rates and burst limits (in bytes per second and bytes, respectively)
///  that every new connection's bucket tree is seeded with. These are server-side defaults; a
///  viewer can renegotiate its drip rates later, see
///  [ConnectionState::set_throttles](crate::connection::ConnectionState::set_throttles).
///
/// The default values correspond to a viewer total bandwidth setting of 1000 kbps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleRates {
    /// bytes per second, indexed by [PacketCategory::index]
    pub rates: [u64; PacketCategory::COUNT],
    /// bytes, indexed by [PacketCategory::index]
    pub bursts: [u64; PacketCategory::COUNT],

    /// Drip rate for a connection's aggregate bucket. `None` means the sum of all category rates.
    pub total_override: Option<u64>,
    /// Burst limit for a connection's aggregate bucket. `None` means the same as [Self::total].
    pub total_limit_override: Option<u64>,
}

impl Default for ThrottleRates {
    fn default() -> Self {
        ThrottleRates {
            //      Resend  Land   Wind  Cloud  Task   Texture Asset  State
            rates: [12500, 12500, 2500, 2500, 38750, 38750, 17500, 31000],
            bursts: [12500, 1400, 1400, 1400, 1400, 1400, 1400, 1400],
            total_override: None,
            total_limit_override: None,
        }
    }
}

impl ThrottleRates {
    /// Loads the rates from a string key/value source (e.g. a section of an ini file). Keys are
    ///  `<category>_default` for drip rates and `<category>_limit` for bursts, with
    ///  `total_default` / `total_limit` for the aggregate. Missing keys keep their defaults.
    pub fn from_config(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<ThrottleRates> {
        let mut result = ThrottleRates::default();

        for category in PacketCategory::ALL {
            let name = config_name(category);
            if let Some(rate) = parse_key(&lookup, &format!("{}_default", name))? {
                result.rates[category.index()] = rate;
            }
            if let Some(burst) = parse_key(&lookup, &format!("{}_limit", name))? {
                result.bursts[category.index()] = burst;
            }
        }

        result.total_override = parse_key(&lookup, "total_default")?;
        result.total_limit_override = parse_key(&lookup, "total_limit")?;
        Ok(result)
    }

    pub fn from_map(values: &FxHashMap<String, String>) -> anyhow::Result<ThrottleRates> {
        Self::from_config(|key| values.get(key).cloned())
    }

    pub fn rate_for(&self, category: PacketCategory) -> u64 {
        self.rates[category.index()]
    }

    pub fn burst_for(&self, category: PacketCategory) -> u64 {
        self.bursts[category.index()]
    }

    pub fn total(&self) -> u64 {
        self.total_override
            .unwrap_or_else(|| self.rates.iter().sum())
    }

    pub fn total_limit(&self) -> u64 {
        self.total_limit_override
            .unwrap_or_else(|| self.total())
    }
}

fn config_name(category: PacketCategory) -> &'static str {
    match category {
        PacketCategory::Resend => "resend",
        PacketCategory::Land => "land",
        PacketCategory::Wind => "wind",
        PacketCategory::Cloud => "cloud",
        PacketCategory::Task => "task",
        PacketCategory::Texture => "texture",
        PacketCategory::Asset => "asset",
        PacketCategory::State => "state",
    }
}

fn parse_key(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => {
            let value = raw.trim().parse::<u64>()
                .with_context(|| format!("invalid throttle value for '{}': {:?}", key, raw))?;
            Ok(Some(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::resend(PacketCategory::Resend, 12500, 12500)]
    #[case::land(PacketCategory::Land, 12500, 1400)]
    #[case::wind(PacketCategory::Wind, 2500, 1400)]
    #[case::cloud(PacketCategory::Cloud, 2500, 1400)]
    #[case::task(PacketCategory::Task, 38750, 1400)]
    #[case::texture(PacketCategory::Texture, 38750, 1400)]
    #[case::asset(PacketCategory::Asset, 17500, 1400)]
    #[case::state(PacketCategory::State, 31000, 1400)]
    fn test_defaults(#[case] category: PacketCategory, #[case] rate: u64, #[case] burst: u64) {
        let rates = ThrottleRates::default();
        assert_eq!(rates.rate_for(category), rate);
        assert_eq!(rates.burst_for(category), burst);
    }

    #[test]
    fn test_default_total() {
        let rates = ThrottleRates::default();
        assert_eq!(rates.total(), 156000);
        assert_eq!(rates.total_limit(), 156000);
    }

    #[test]
    fn test_from_map() {
        let mut values = FxHashMap::default();
        values.insert("land_default".to_string(), "1000".to_string());
        values.insert("texture_limit".to_string(), " 5000 ".to_string());
        values.insert("total_limit".to_string(), "99".to_string());

        let rates = ThrottleRates::from_map(&values).unwrap();
        assert_eq!(rates.rate_for(PacketCategory::Land), 1000);
        assert_eq!(rates.burst_for(PacketCategory::Texture), 5000);
        assert_eq!(rates.rate_for(PacketCategory::Wind), 2500);
        assert_eq!(rates.total(), 156000 - 12500 + 1000);
        assert_eq!(rates.total_limit(), 99);
    }

    #[test]
    fn test_from_map_invalid_value() {
        let mut values = FxHashMap::default();
        values.insert("asset_default".to_string(), "fast".to_string());

        assert!(ThrottleRates::from_map(&values).is_err());
    }
}
