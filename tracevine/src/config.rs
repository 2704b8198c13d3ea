//! Agent configuration.
//!
//! Configuration represents the agent-wide tracing settings; overrides can be
//! set for the defaults through the environment.

use std::env;
use std::str::FromStr;

use crate::ids::{IdGenerator, RandomIdGenerator};
use crate::sampler::Sampler;
use crate::vine_warn;

/// Default ceiling on segments per transaction, root included.
pub(crate) const DEFAULT_MAX_SEGMENTS: usize = 900;

/// Agent configuration
#[derive(Debug)]
#[non_exhaustive]
pub struct Config {
    /// The sampler that the agent should use
    pub sampler: Sampler,

    /// The id generator that the agent should use
    pub id_generator: Box<dyn IdGenerator>,

    /// Ceiling on segments per transaction, root included. Recording beyond
    /// it degrades to pass-through rather than growing the tree.
    pub max_segments_per_transaction: usize,

    /// Whether captured call arguments are attached to segments.
    pub capture_attributes: bool,
}

impl Default for Config {
    /// Create default agent configuration.
    fn default() -> Self {
        let mut config = Config {
            sampler: Sampler::AlwaysOn,
            id_generator: Box::<RandomIdGenerator>::default(),
            max_segments_per_transaction: DEFAULT_MAX_SEGMENTS,
            capture_attributes: true,
        };

        if let Some(max_segments) = env::var("TRACEVINE_MAX_SEGMENTS")
            .ok()
            .and_then(|max_segments| usize::from_str(&max_segments).ok())
        {
            config.max_segments_per_transaction = max_segments;
        }

        if let Some(capture) = env::var("TRACEVINE_CAPTURE_ATTRIBUTES")
            .ok()
            .and_then(|capture| bool::from_str(&capture).ok())
        {
            config.capture_attributes = capture;
        }

        let sampler_arg = env::var("TRACEVINE_SAMPLER_ARG").ok();
        if let Ok(sampler) = env::var("TRACEVINE_SAMPLER") {
            config.sampler = match sampler.as_str() {
                "always_on" => Sampler::AlwaysOn,
                "always_off" => Sampler::AlwaysOff,
                "priority_ratio" => {
                    let ratio = sampler_arg.as_ref().and_then(|r| r.parse::<f64>().ok());
                    if let Some(r) = ratio {
                        Sampler::PriorityRatio(r)
                    } else {
                        vine_warn!(
                            name: "Agent.Config.InvalidSamplerArgument",
                            message = "TRACEVINE_SAMPLER is set to 'priority_ratio' but TRACEVINE_SAMPLER_ARG environment variable is missing or invalid. TRACEVINE_SAMPLER_ARG must be a valid float between 0.0 and 1.0 representing the desired sampling probability (0.0 = no transactions sampled, 1.0 = all transactions sampled, 0.5 = 50% of transactions sampled). Falling back to default ratio: 1.0 (100% sampling)",
                            tracevine_sampler_arg = format!("{:?}", sampler_arg)
                        );
                        Sampler::PriorityRatio(1.0)
                    }
                }
                s => {
                    vine_warn!(
                        name: "Agent.Config.InvalidSamplerType",
                        message = format!(
                            "Unrecognized sampler type '{}' in TRACEVINE_SAMPLER environment variable. Valid values are: always_on, always_off, priority_ratio. Using fallback sampler: AlwaysOn",
                            s
                        ),
                    );
                    Sampler::AlwaysOn
                }
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        temp_env::with_vars_unset(
            [
                "TRACEVINE_MAX_SEGMENTS",
                "TRACEVINE_CAPTURE_ATTRIBUTES",
                "TRACEVINE_SAMPLER",
                "TRACEVINE_SAMPLER_ARG",
            ],
            || {
                let config = Config::default();
                assert_eq!(config.sampler, Sampler::AlwaysOn);
                assert_eq!(config.max_segments_per_transaction, DEFAULT_MAX_SEGMENTS);
                assert!(config.capture_attributes);
            },
        );
    }

    #[test]
    fn env_overrides_limits() {
        temp_env::with_vars(
            [
                ("TRACEVINE_MAX_SEGMENTS", Some("10")),
                ("TRACEVINE_CAPTURE_ATTRIBUTES", Some("false")),
            ],
            || {
                let config = Config::default();
                assert_eq!(config.max_segments_per_transaction, 10);
                assert!(!config.capture_attributes);
            },
        );
    }

    #[test]
    fn invalid_limit_is_ignored() {
        temp_env::with_var("TRACEVINE_MAX_SEGMENTS", Some("not-a-number"), || {
            let config = Config::default();
            assert_eq!(config.max_segments_per_transaction, DEFAULT_MAX_SEGMENTS);
        });
    }

    #[test]
    fn env_selects_sampler() {
        temp_env::with_vars(
            [
                ("TRACEVINE_SAMPLER", Some("priority_ratio")),
                ("TRACEVINE_SAMPLER_ARG", Some("0.25")),
            ],
            || {
                let config = Config::default();
                assert_eq!(config.sampler, Sampler::PriorityRatio(0.25));
            },
        );
    }

    #[test]
    fn missing_sampler_arg_falls_back() {
        temp_env::with_vars(
            [
                ("TRACEVINE_SAMPLER", Some("priority_ratio")),
                ("TRACEVINE_SAMPLER_ARG", None),
            ],
            || {
                let config = Config::default();
                assert_eq!(config.sampler, Sampler::PriorityRatio(1.0));
            },
        );
    }

    #[test]
    fn unknown_sampler_falls_back() {
        temp_env::with_var("TRACEVINE_SAMPLER", Some("jaeger"), || {
            let config = Config::default();
            assert_eq!(config.sampler, Sampler::AlwaysOn);
        });
    }
}
