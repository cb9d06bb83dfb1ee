//! Tunable timing parameters plus the line-preserving file format shared by
//! the node binary and the `speedctl` companion tool.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// All durations the design names, in seconds, plus the integer starting
/// round number. Defaults match the "normal" speed profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub heartbeat_int: Duration,
    pub fail_timeout: Duration,
    pub hello_timeout: Duration,
    pub bully_timeout: Duration,
    pub election_start_delay: Duration,
    pub leader_death_delay: Duration,
    pub bully_poll_interval: Duration,
    pub leader_startup_delay: Duration,
    pub monitor_interval: Duration,
    pub monitor_startup_grace: Duration,
    pub consensus_interval: Duration,
    pub consensus_response_timeout: Duration,
    pub value_process_delay: Duration,
    pub start_consensus_delay: Duration,
    pub round_query_timeout: Duration,
    pub round_start: u64,
    pub main_loop_interval: Duration,
    pub leader_search_interval: Duration,
    pub status_log_interval: Duration,
    pub network_retry_delay: Duration,
    pub network_log_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heartbeat_int: secs(0.3),
            fail_timeout: secs(4.0),
            hello_timeout: secs(2.0),
            bully_timeout: secs(3.0),
            election_start_delay: secs(0.3),
            leader_death_delay: secs(0.1),
            bully_poll_interval: secs(0.1),
            leader_startup_delay: secs(2.0),
            monitor_interval: secs(0.3),
            monitor_startup_grace: secs(5.0),
            consensus_interval: secs(8.0),
            consensus_response_timeout: secs(3.0),
            value_process_delay: secs(1.0),
            start_consensus_delay: secs(1.5),
            round_query_timeout: secs(1.5),
            round_start: 0,
            main_loop_interval: secs(1.0),
            leader_search_interval: secs(5.0),
            status_log_interval: secs(30.0),
            network_retry_delay: secs(2.0),
            network_log_interval: secs(10.0),
        }
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

/// A single `KEY = VALUE` parameter: how to read it out of and write it back
/// into a [`Config`], plus the description used when generating a fresh file.
struct ParamSpec {
    name: &'static str,
    description: &'static str,
    get: fn(&Config) -> f64,
    set: fn(&mut Config, f64),
}

macro_rules! param {
    ($name:literal, $desc:literal, $field:ident) => {
        ParamSpec {
            name: $name,
            description: $desc,
            get: |c| c.$field.as_secs_f64(),
            set: |c, v| c.$field = secs(v),
        }
    };
}

const PARAMS: &[ParamSpec] = &[
    param!(
        "HEARTBEAT_INT",
        "seconds between heartbeat emissions",
        heartbeat_int
    ),
    param!(
        "FAIL_TIMEOUT",
        "seconds of silence before a peer is aged out",
        fail_timeout
    ),
    param!(
        "HELLO_TIMEOUT",
        "seconds to wait for a HELLO_ACK during discovery",
        hello_timeout
    ),
    param!(
        "BULLY_TIMEOUT",
        "seconds a campaign waits for a higher OK",
        bully_timeout
    ),
    param!(
        "ELECTION_START_DELAY",
        "seconds before a challenger starts its own election",
        election_start_delay
    ),
    param!(
        "LEADER_DEATH_DELAY",
        "seconds before starting an election after the leader ages out",
        leader_death_delay
    ),
    param!(
        "BULLY_POLL_INTERVAL",
        "seconds between received_ok polls during a campaign",
        bully_poll_interval
    ),
    param!(
        "LEADER_STARTUP_DELAY",
        "seconds before a new leader starts its first round",
        leader_startup_delay
    ),
    param!(
        "MONITOR_INTERVAL",
        "seconds between failure-detector sweeps",
        monitor_interval
    ),
    param!(
        "MONITOR_STARTUP_GRACE",
        "seconds after boot during which no peer is aged out",
        monitor_startup_grace
    ),
    param!(
        "CONSENSUS_INTERVAL",
        "seconds between rounds started by the leader",
        consensus_interval
    ),
    param!(
        "CONSENSUS_RESPONSE_TIMEOUT",
        "seconds the leader waits for RESPONSE records",
        consensus_response_timeout
    ),
    param!(
        "VALUE_PROCESS_DELAY",
        "seconds before computing the max over received values",
        value_process_delay
    ),
    param!(
        "START_CONSENSUS_DELAY",
        "seconds a follower waits before computing the max",
        start_consensus_delay
    ),
    param!(
        "ROUND_QUERY_TIMEOUT",
        "seconds a new leader waits for ROUND_RESPONSE records",
        round_query_timeout
    ),
    ParamSpec {
        name: "ROUND_START",
        description: "initial round number",
        get: |c| c.round_start as f64,
        set: |c, v| c.round_start = v as u64,
    },
    param!(
        "MAIN_LOOP_INTERVAL",
        "seconds between main loop ticks",
        main_loop_interval
    ),
    param!(
        "LEADER_SEARCH_INTERVAL",
        "seconds between HELLO re-publications while leaderless",
        leader_search_interval
    ),
    param!(
        "STATUS_LOG_INTERVAL",
        "seconds between periodic status lines",
        status_log_interval
    ),
    param!(
        "NETWORK_RETRY_DELAY",
        "seconds to sleep between reconnection attempts",
        network_retry_delay
    ),
    param!(
        "NETWORK_LOG_INTERVAL",
        "seconds between disconnected-network log lines",
        network_log_interval
    ),
];

impl Config {
    /// Validates the cross-parameter timing constraints that keep the
    /// failure detector and election timers from racing each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |cond: bool, param, constraint, value: Duration| {
            if cond {
                Ok(())
            } else {
                Err(ConfigError::Constraint {
                    param,
                    constraint,
                    value: format!("{:.3}s", value.as_secs_f64()),
                })
            }
        };
        check(
            self.fail_timeout > self.heartbeat_int * 3,
            "FAIL_TIMEOUT",
            "greater than 3 * HEARTBEAT_INT",
            self.fail_timeout,
        )?;
        check(
            self.hello_timeout < self.monitor_startup_grace,
            "HELLO_TIMEOUT",
            "less than MONITOR_STARTUP_GRACE",
            self.hello_timeout,
        )?;
        check(
            self.bully_timeout > self.election_start_delay,
            "BULLY_TIMEOUT",
            "greater than ELECTION_START_DELAY",
            self.bully_timeout,
        )?;
        check(
            self.monitor_startup_grace > self.hello_timeout,
            "MONITOR_STARTUP_GRACE",
            "greater than HELLO_TIMEOUT",
            self.monitor_startup_grace,
        )?;
        check(
            self.consensus_interval > self.consensus_response_timeout,
            "CONSENSUS_INTERVAL",
            "greater than CONSENSUS_RESPONSE_TIMEOUT",
            self.consensus_interval,
        )?;
        check(
            self.consensus_response_timeout > self.value_process_delay,
            "CONSENSUS_RESPONSE_TIMEOUT",
            "greater than VALUE_PROCESS_DELAY",
            self.consensus_response_timeout,
        )?;
        check(
            self.round_query_timeout < self.leader_startup_delay,
            "ROUND_QUERY_TIMEOUT",
            "less than LEADER_STARTUP_DELAY",
            self.round_query_timeout,
        )?;
        Ok(())
    }

    /// Loads a config file written in the `KEY = VALUE` format below,
    /// falling back to [`Config::default`] for any parameter the file
    /// doesn't mention. Unrecognized lines are ignored (not an error): the
    /// loader is deliberately forgiving, the writer is what preserves them.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut config = Config::default();
        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, rest)) = trimmed.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value_str = rest.split('#').next().unwrap_or("").trim();
            let Some(spec) = PARAMS.iter().find(|p| p.name == key) else {
                continue;
            };
            let value: f64 = value_str.parse().map_err(|_| ConfigError::Parse {
                line: lineno + 1,
                content: line.to_string(),
            })?;
            (spec.set)(&mut config, value);
        }
        Ok(config)
    }

    /// Renders every known parameter as a fresh `KEY = VALUE` file with a
    /// trailing comment describing it. Used when no file exists yet.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Bully coordination core — timing parameters.\n");
        out.push_str("# Generated by speedctl; rerun with --speed to rescale.\n\n");
        for spec in PARAMS {
            let value = (spec.get)(self);
            out.push_str(&format!(
                "{} = {}        # {}\n",
                spec.name,
                format_value(value),
                spec.description
            ));
        }
        out
    }

    /// Rewrites `path` in place with this config's values, preserving every
    /// line the parser doesn't recognize as a known `KEY = VALUE` assignment,
    /// including comments and blank lines.
    pub fn write_in_place(&self, path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let existing = fs::read_to_string(path)?;
        let mut seen = vec![false; PARAMS.len()];
        let mut out_lines = Vec::new();

        for line in existing.lines() {
            let trimmed = line.trim();
            let matched = (!trimmed.is_empty() && !trimmed.starts_with('#'))
                .then(|| trimmed.split_once('='))
                .flatten()
                .and_then(|(key, _)| PARAMS.iter().position(|p| p.name == key.trim()));

            match matched {
                Some(idx) => {
                    seen[idx] = true;
                    let spec = &PARAMS[idx];
                    out_lines.push(format!(
                        "{} = {}        # {}",
                        spec.name,
                        format_value((spec.get)(self)),
                        spec.description
                    ));
                }
                None => out_lines.push(line.to_string()),
            }
        }

        for (idx, spec) in PARAMS.iter().enumerate() {
            if !seen[idx] {
                out_lines.push(format!(
                    "{} = {}        # {}",
                    spec.name,
                    format_value((spec.get)(self)),
                    spec.description
                ));
            }
        }

        let mut file = fs::File::create(path)?;
        for line in out_lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        let s = format!("{v:.3}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for spec in PARAMS {
            writeln!(f, "  {} = {}", spec.name, format_value((spec.get)(self)))?;
        }
        Ok(())
    }
}

/// Named, pre-scaled parameter sets for the `speedctl --speed` CLI.
/// `normal` is exactly [`Config::default`]; the others scale every duration
/// by a constant factor while leaving `ROUND_START` untouched. `demo` runs
/// far faster than real time, for watching an election settle live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Speed {
    Demo,
    Slow,
    Normal,
    Fast,
}

impl Speed {
    pub fn scale(self) -> f64 {
        match self {
            Speed::Demo => 0.15,
            Speed::Slow => 3.0,
            Speed::Normal => 1.0,
            Speed::Fast => 0.4,
        }
    }

    pub fn all() -> [Speed; 4] {
        [Speed::Demo, Speed::Slow, Speed::Normal, Speed::Fast]
    }

    pub fn name(self) -> &'static str {
        match self {
            Speed::Demo => "demo",
            Speed::Slow => "slow",
            Speed::Normal => "normal",
            Speed::Fast => "fast",
        }
    }

    /// Applies this profile's scale factor to every duration in `base`,
    /// rounded to millisecond precision so the rendered file stays readable.
    pub fn apply(self, base: &Config) -> Config {
        let scale = self.scale();
        let mut out = base.clone();
        for spec in PARAMS {
            if spec.name == "ROUND_START" {
                continue;
            }
            let scaled = ((spec.get)(base) * scale * 1000.0).round() / 1000.0;
            (spec.set)(&mut out, scaled.max(0.001));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn fail_timeout_violation_is_rejected() {
        let mut cfg = Config::default();
        cfg.fail_timeout = cfg.heartbeat_int * 2;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Constraint { param: "FAIL_TIMEOUT", .. })
        ));
    }

    #[test]
    fn hello_timeout_must_be_inside_startup_grace() {
        let mut cfg = Config::default();
        cfg.hello_timeout = cfg.monitor_startup_grace + Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_query_timeout_must_stay_under_leader_startup_delay() {
        let mut cfg = Config::default();
        cfg.round_query_timeout = cfg.leader_startup_delay;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Constraint { param: "ROUND_QUERY_TIMEOUT", .. })
        ));
    }

    #[test]
    fn every_speed_profile_stays_valid() {
        let base = Config::default();
        for speed in Speed::all() {
            speed.apply(&base).validate().unwrap_or_else(|e| {
                panic!("{:?} profile violates a constraint: {e}", speed)
            });
        }
    }

    #[test]
    fn load_falls_back_to_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.conf");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "HEARTBEAT_INT = 0.5   # overridden").unwrap();
        writeln!(f, "# a comment line").unwrap();
        writeln!(f, "NOT_A_REAL_PARAM = 7").unwrap();
        drop(f);

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.heartbeat_int, Duration::from_secs_f64(0.5));
        assert_eq!(cfg.fail_timeout, Config::default().fail_timeout);
    }

    #[test]
    fn write_in_place_preserves_comments_and_unknown_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.conf");
        fs::write(
            &path,
            "# header comment\nHEARTBEAT_INT = 0.3   # seconds\nSOME_FUTURE_KEY = 99\n",
        )
        .unwrap();

        let scaled = Speed::Slow.apply(&Config::default());
        scaled.write_in_place(&path).unwrap();

        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("# header comment"));
        assert!(rewritten.contains("SOME_FUTURE_KEY = 99"));
        assert!(rewritten.contains("HEARTBEAT_INT = 0.9"));
    }

    #[test]
    fn write_in_place_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.conf");
        let err = Config::default().write_in_place(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }
}
