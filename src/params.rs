//! Runtime configuration.
//!
//! Defaults come from [`crate::constants`]. The binary fills these structs
//! from command-line flags; the UCI front-end updates them through
//! [`SearchParams::set_option`].

use std::path::PathBuf;
use std::str::FromStr;

use crate::constants::*;
use crate::error::ParamError;

/// Settings of the helper-engine pool.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxEngineParams {
    /// Helper executable. No helpers run when unset.
    pub path: Option<PathBuf>,
    /// Extra command-line arguments for the helper.
    pub args: Vec<String>,
    pub instances: usize,
    /// `setoption` pairs sent to every helper at startup.
    pub options: Vec<(String, String)>,
    /// `setoption` pairs for helper 0; non-empty selects root-pinned mode.
    pub options_on_root: Vec<(String, String)>,
    /// Time per queue-driven query, in milliseconds.
    pub time_ms: u64,
    /// Visits before a node is queued for analysis (0 disables queueing).
    pub threshold: u32,
    pub max_depth: u32,
    /// Forwarded when a helper advertises `SyzygyPath`.
    pub syzygy_path: Option<String>,
    pub node_queue_cap: usize,
    pub pv_queue_cap: usize,
    pub min_pv_len: usize,
}

impl Default for AuxEngineParams {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            instances: DEFAULT_AUX_INSTANCES,
            options: Vec::new(),
            options_on_root: Vec::new(),
            time_ms: DEFAULT_AUX_TIME_MS,
            threshold: DEFAULT_AUX_THRESHOLD,
            max_depth: DEFAULT_AUX_MAX_DEPTH,
            syzygy_path: None,
            node_queue_cap: NODE_QUEUE_CAP,
            pv_queue_cap: PV_QUEUE_CAP,
            min_pv_len: MIN_PV_LEN,
        }
    }
}

impl AuxEngineParams {
    /// Helper 0 analyzes the root continuously instead of reading the queue.
    pub fn root_pinned(&self) -> bool {
        !self.options_on_root.is_empty()
    }
}

/// Settings of the primary search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub threads: usize,
    pub task_workers: usize,
    pub minibatch_size: usize,
    pub max_collision_events: usize,
    pub max_injected_per_batch: usize,
    pub cpuct: f32,
    pub fpu_reduction: f32,
    pub draw_score: f32,
    pub cache_size: usize,
    pub aux: AuxEngineParams,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            task_workers: DEFAULT_TASK_WORKERS,
            minibatch_size: DEFAULT_MINIBATCH_SIZE,
            max_collision_events: DEFAULT_MAX_COLLISION_EVENTS,
            max_injected_per_batch: DEFAULT_MAX_INJECTED_PER_BATCH,
            cpuct: DEFAULT_CPUCT,
            fpu_reduction: DEFAULT_FPU_REDUCTION,
            draw_score: DEFAULT_DRAW_SCORE,
            cache_size: DEFAULT_CACHE_SIZE,
            aux: AuxEngineParams::default(),
        }
    }
}

/// UCI options understood by [`SearchParams::set_option`], as advertised.
const UCI_OPTIONS: &[&str] = &[
    "option name Threads type spin default 2 min 1 max 128",
    "option name TaskWorkers type spin default 0 min 0 max 32",
    "option name MinibatchSize type spin default 32 min 1 max 1024",
    "option name MaxCollisionEvents type spin default 32 min 1 max 1024",
    "option name MaxInjectedPerBatch type spin default 16 min 0 max 1024",
    "option name CPuct type string default 1.745",
    "option name FpuReduction type string default 0.33",
    "option name DrawScore type string default 0.0",
    "option name NNCacheSize type spin default 200000 min 0 max 100000000",
    "option name AuxEngineFile type string default <empty>",
    "option name AuxEngineOptions type string default <empty>",
    "option name AuxEngineOptionsOnRoot type string default <empty>",
    "option name AuxEngineInstances type spin default 1 min 1 max 64",
    "option name AuxEngineTime type spin default 100 min 1 max 100000",
    "option name AuxEngineThreshold type spin default 100 min 0 max 1000000",
    "option name AuxEngineMaxDepth type spin default 5 min 0 max 100",
    "option name SyzygyPath type string default <empty>",
];

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, ParamError> {
    value.trim().parse().map_err(|_| ParamError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn optional_string(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != "<empty>").then(|| value.to_string())
}

impl SearchParams {
    pub fn uci_options() -> &'static [&'static str] {
        UCI_OPTIONS
    }

    /// Apply a UCI `setoption`. Names are case-insensitive.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        match name.to_ascii_lowercase().as_str() {
            "threads" => self.threads = parse_value::<usize>(name, value)?.max(1),
            "taskworkers" => self.task_workers = parse_value(name, value)?,
            "minibatchsize" => self.minibatch_size = parse_value::<usize>(name, value)?.max(1),
            "maxcollisionevents" => self.max_collision_events = parse_value::<usize>(name, value)?.max(1),
            "maxinjectedperbatch" => self.max_injected_per_batch = parse_value(name, value)?,
            "cpuct" => self.cpuct = parse_value(name, value)?,
            "fpureduction" => self.fpu_reduction = parse_value(name, value)?,
            "drawscore" => self.draw_score = parse_value(name, value)?,
            "nncachesize" => self.cache_size = parse_value(name, value)?,
            "auxenginefile" => self.aux.path = optional_string(value).map(PathBuf::from),
            "auxengineoptions" => self.aux.options = parse_engine_options(value)?,
            "auxengineoptionsonroot" => self.aux.options_on_root = parse_engine_options(value)?,
            "auxengineinstances" => self.aux.instances = parse_value::<usize>(name, value)?.max(1),
            "auxenginetime" => self.aux.time_ms = parse_value::<u64>(name, value)?.max(1),
            "auxenginethreshold" => self.aux.threshold = parse_value(name, value)?,
            "auxenginemaxdepth" => self.aux.max_depth = parse_value(name, value)?,
            "syzygypath" => self.aux.syzygy_path = optional_string(value),
            _ => return Err(ParamError::UnknownOption(name.to_string())),
        }
        Ok(())
    }
}

/// Parse helper options written as `Name=Value;Name2=Value2`.
///
/// Empty segments are skipped; a segment without `=` is an error.
pub fn parse_engine_options(text: &str) -> Result<Vec<(String, String)>, ParamError> {
    let mut options = Vec::new();
    for segment in text.split(';') {
        let segment = segment.trim();
        if segment.is_empty() || segment == "<empty>" {
            continue;
        }
        match segment.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                options.push((name.trim().to_string(), value.trim().to_string()));
            }
            _ => {
                return Err(ParamError::InvalidValue {
                    name: "engine options".to_string(),
                    value: segment.to_string(),
                });
            }
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_options() {
        let options = parse_engine_options("Threads=2; Hash=64;;MultiPV = 1").expect("valid");
        assert_eq!(
            options,
            vec![
                ("Threads".to_string(), "2".to_string()),
                ("Hash".to_string(), "64".to_string()),
                ("MultiPV".to_string(), "1".to_string()),
            ]
        );
        assert!(parse_engine_options("").expect("empty").is_empty());
        assert!(parse_engine_options("Threads").is_err());
        assert!(parse_engine_options("=3").is_err());
    }

    #[test]
    fn test_set_option_is_case_insensitive() {
        let mut params = SearchParams::default();
        params.set_option("auxengineinstances", "3").expect("valid");
        params.set_option("AuxEngineFile", "/usr/bin/helper").expect("valid");
        params.set_option("AuxEngineOptionsOnRoot", "Threads=4").expect("valid");
        assert_eq!(params.aux.instances, 3);
        assert_eq!(params.aux.path, Some(PathBuf::from("/usr/bin/helper")));
        assert!(params.aux.root_pinned());
    }

    #[test]
    fn test_set_option_rejects_bad_input() {
        let mut params = SearchParams::default();
        assert!(matches!(
            params.set_option("Threads", "many"),
            Err(ParamError::InvalidValue { .. })
        ));
        assert!(matches!(
            params.set_option("Contempt", "10"),
            Err(ParamError::UnknownOption(_))
        ));
        params.set_option("AuxEngineFile", "<empty>").expect("valid");
        assert_eq!(params.aux.path, None);
    }

    #[test]
    fn test_every_advertised_option_is_settable() {
        for line in SearchParams::uci_options() {
            let name = line
                .strip_prefix("option name ")
                .and_then(|rest| rest.split(" type ").next())
                .expect("well-formed option line");
            let value = if line.contains("type spin") { "1" } else { "" };
            let mut params = SearchParams::default();
            assert!(
                params.set_option(name, value).is_ok() || line.contains("type string"),
                "{name} rejected"
            );
        }
    }
}
