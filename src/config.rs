//! Runtime configuration for a [`Graph`](crate::Graph).

use std::env;

/// Smallest fan-in a reduction step accepts.
pub const MIN_REDUCE_FAN_IN: usize = 2;

/// Settings for a [`Graph`](crate::Graph) and its built-in accelerator.
///
/// Build with [`Config::default`] and the `with_*` setters, or start from
/// the environment with [`Config::from_env`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Element capacity of the simulated accelerator created by [`Graph::new`](crate::Graph::new).
    pub accelerator_capacity: usize,
    /// Elements folded per reduction step.
    pub reduce_fan_in: usize,
    /// Dispatch launches on the rayon pool.
    pub parallel: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            accelerator_capacity: 1 << 24,
            reduce_fan_in: 32,
            parallel: true,
        }
    }
}

impl Config {
    pub fn with_accelerator_capacity(mut self, elements: usize) -> Self {
        self.accelerator_capacity = elements;
        self
    }

    /// Clamped to at least [`MIN_REDUCE_FAN_IN`].
    pub fn with_reduce_fan_in(mut self, fan_in: usize) -> Self {
        self.reduce_fan_in = fan_in.max(MIN_REDUCE_FAN_IN);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Defaults overridden by `HETGRAD_ACCEL_CAPACITY`, `HETGRAD_REDUCE_FAN_IN`
    /// and `HETGRAD_PARALLEL`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Config::default();
        if let Some(v) = lookup("HETGRAD_ACCEL_CAPACITY").and_then(|v| parse_usize(&v)) {
            cfg.accelerator_capacity = v;
        }
        if let Some(v) = lookup("HETGRAD_REDUCE_FAN_IN").and_then(|v| parse_usize(&v)) {
            cfg = cfg.with_reduce_fan_in(v);
        }
        match lookup("HETGRAD_PARALLEL") {
            Some(v) if !v.trim().is_empty() => cfg.parallel = parse_bool(&v),
            _ => {}
        }
        cfg
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(value: &str) -> Option<usize> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        log::warn!("ignoring unparseable config value {value:?}");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        assert_eq!(Config::from_lookup(lookup(&[])), Config::default());
    }

    #[test]
    fn env_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("HETGRAD_ACCEL_CAPACITY", "1024"),
            ("HETGRAD_REDUCE_FAN_IN", "1"),
            ("HETGRAD_PARALLEL", "off"),
        ]));
        assert_eq!(cfg.accelerator_capacity, 1024);
        assert_eq!(cfg.reduce_fan_in, MIN_REDUCE_FAN_IN);
        assert!(!cfg.parallel);
    }

    #[test]
    fn garbage_is_ignored() {
        let cfg = Config::from_lookup(lookup(&[
            ("HETGRAD_ACCEL_CAPACITY", "lots"),
            ("HETGRAD_PARALLEL", " YES "),
        ]));
        assert_eq!(cfg.accelerator_capacity, Config::default().accelerator_capacity);
        assert!(cfg.parallel);
    }
}
