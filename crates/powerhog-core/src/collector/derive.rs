//! Derivation of a [`Snapshot`] from a parsed [`Record`].
//!
//! powermetrics reports most per-process values as rates, and the interval it
//! actually slept can be longer than requested (host sleep, load), so every
//! rate is multiplied by the measured `elapsed_ns`:
//!
//! ```text
//! energy_impact = energy_impact_per_s × elapsed_s
//! cputime_ns    = cputime_ms_per_s × 1e6 × elapsed_s
//! cputime_per   = cputime_ns / elapsed_ns × 100
//! ```
//!
//! Processor energies are normalized to milli-joules for both hardware families.

use super::cmdline::InterpreterRenamer;
use super::parser::{RawEntry, RawProcessor, Record};
use crate::carbon::{GridIntensity, operational_carbon_g};
use crate::config::Settings;
use crate::storage::model::{ProcessSample, ProcessorReport, Snapshot};
use crate::util::SystemProcessTable;

/// Number of processes kept per sample.
pub const TOP_N: usize = 15;

const NS_PER_S: f64 = 1e9;

#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    #[error("sample has a zero-length interval")]
    ZeroInterval,
    #[error("record has neither Apple silicon nor Intel processor counters")]
    MissingProcessorCounters,
}

/// Processor energies in milli-joules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnergyMj {
    pub combined: i64,
    pub cpu: i64,
    pub gpu: i64,
    pub ane: i64,
}

fn to_mj(value: f64) -> i64 {
    // negative counters show up after counter resets
    value.round().max(0.0) as i64
}

impl ProcessorReport {
    /// Picks the hardware family by the presence of `ane_energy`.
    pub fn from_raw(raw: &RawProcessor) -> Result<Self, DeriveError> {
        if let Some(ane_energy) = raw.ane_energy {
            return Ok(ProcessorReport::Arm {
                combined_power: raw.combined_power.unwrap_or_default(),
                cpu_energy: raw.cpu_energy.unwrap_or_default(),
                gpu_energy: raw.gpu_energy.unwrap_or_default(),
                ane_energy,
            });
        }
        match raw.package_joules {
            Some(package_joules) => Ok(ProcessorReport::Intel {
                package_joules,
                cpu_joules: raw.cpu_joules.unwrap_or_default(),
                igpu_watts: raw.igpu_watts.unwrap_or_default(),
            }),
            None => Err(DeriveError::MissingProcessorCounters),
        }
    }

    pub fn energies_mj(&self, elapsed_s: f64) -> EnergyMj {
        match *self {
            ProcessorReport::Arm {
                combined_power,
                cpu_energy,
                gpu_energy,
                ane_energy,
            } => EnergyMj {
                combined: to_mj(combined_power * elapsed_s),
                cpu: to_mj(cpu_energy),
                gpu: to_mj(gpu_energy),
                ane: to_mj(ane_energy),
            },
            ProcessorReport::Intel {
                package_joules,
                cpu_joules,
                igpu_watts,
            } => EnergyMj {
                combined: to_mj(package_joules * 1000.0),
                cpu: to_mj(cpu_joules * 1000.0),
                gpu: to_mj(igpu_watts * elapsed_s * 1000.0),
                ane: 0,
            },
        }
    }
}

/// Replaces shell/terminal coalitions, and coalitions without a name, by
/// their tasks. Everything a user starts from a terminal would otherwise be
/// attributed to the terminal app.
pub fn flatten_coalitions(coalitions: &[RawEntry], shells: &[String]) -> Vec<RawEntry> {
    let mut entries = Vec::with_capacity(coalitions.len());
    for coalition in coalitions {
        let name = coalition.name.trim();
        if name.is_empty() || shells.iter().any(|shell| shell == name) {
            entries.extend(coalition.tasks.iter().cloned());
        } else {
            entries.push(coalition.clone());
        }
    }
    entries
}

/// Rate-corrected sample of one coalition or task.
pub fn process_sample(entry: &RawEntry, elapsed_ns: u64) -> ProcessSample {
    let elapsed_s = elapsed_ns as f64 / NS_PER_S;
    let cputime_ns = (entry.cputime_ms_per_s * 1e6 * elapsed_s).round().max(0.0) as i64;
    let cputime_per = if elapsed_ns == 0 {
        0
    } else {
        (cputime_ns as f64 / elapsed_ns as f64 * 100.0) as i64
    };
    ProcessSample {
        name: entry.name.clone(),
        pid: entry.pid,
        energy_impact: (entry.energy_impact_per_s * elapsed_s).max(0.0),
        cputime_ns,
        cputime_per,
    }
}

/// The `n` entries with the highest energy impact, highest first.
/// Equal impacts keep their input order.
pub fn top_n(mut processes: Vec<ProcessSample>, n: usize) -> Vec<ProcessSample> {
    processes.sort_by(|a, b| b.energy_impact.total_cmp(&a.energy_impact));
    processes.truncate(n);
    processes
}

/// Turns records into snapshots. Owns the optional enrichment state
/// (interpreter name cache, carbon intensity cache).
pub struct Deriver {
    shell_coalitions: Vec<String>,
    renamer: Option<InterpreterRenamer>,
    intensity: Option<GridIntensity>,
}

impl Deriver {
    pub fn new(shell_coalitions: Vec<String>) -> Self {
        Self {
            shell_coalitions,
            renamer: None,
            intensity: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut deriver = Self::new(settings.shell_coalitions.clone());
        if settings.rename_interpreters {
            deriver = deriver.with_renamer(InterpreterRenamer::new(Box::new(
                SystemProcessTable::new(),
            )));
        }
        if let Some(intensity) = GridIntensity::from_settings(settings) {
            deriver = deriver.with_intensity(intensity);
        }
        deriver
    }

    pub fn with_renamer(mut self, renamer: InterpreterRenamer) -> Self {
        self.renamer = Some(renamer);
        self
    }

    pub fn with_intensity(mut self, intensity: GridIntensity) -> Self {
        self.intensity = Some(intensity);
        self
    }

    pub fn derive(&mut self, record: Record) -> Result<Snapshot, DeriveError> {
        if record.elapsed_ns == 0 {
            return Err(DeriveError::ZeroInterval);
        }
        let elapsed_s = record.elapsed_ns as f64 / NS_PER_S;

        let processor = ProcessorReport::from_raw(&record.processor)?;
        let energy = processor.energies_mj(elapsed_s);

        let samples = flatten_coalitions(&record.coalitions, &self.shell_coalitions)
            .iter()
            .map(|entry| process_sample(entry, record.elapsed_ns))
            .collect();
        let mut top_processes = top_n(samples, TOP_N);
        if let Some(renamer) = self.renamer.as_mut() {
            renamer.rename(&mut top_processes);
        }

        let grid_intensity = self.intensity.as_mut().and_then(GridIntensity::current);
        let co2eq_g = grid_intensity.map(|i| operational_carbon_g(energy.combined, i));

        let energy_impact = (record.all_tasks.energy_impact_per_s * elapsed_s).max(0.0);

        Ok(Snapshot {
            timestamp: record.timestamp,
            elapsed_ns: record.elapsed_ns,
            processor,
            combined_energy_mj: energy.combined,
            cpu_energy_mj: energy.cpu,
            gpu_energy_mj: energy.gpu,
            ane_energy_mj: energy.ane,
            energy_impact,
            top_processes,
            hw_model: record.hw_model,
            thermal_pressure: record.thermal_pressure,
            os_version: record.os_version,
            grid_intensity,
            co2eq_g,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::parser::RawAllTasks;

    fn entry(name: &str, impact_per_s: f64) -> RawEntry {
        RawEntry {
            name: name.into(),
            energy_impact_per_s: impact_per_s,
            ..Default::default()
        }
    }

    fn record(elapsed_ns: u64, processor: RawProcessor, coalitions: Vec<RawEntry>) -> Record {
        Record {
            timestamp: 1_694_332_800_000,
            elapsed_ns,
            hw_model: "Mac14,2".into(),
            os_version: "23A344".into(),
            thermal_pressure: "Nominal".into(),
            processor,
            all_tasks: RawAllTasks {
                energy_impact: 0.0,
                energy_impact_per_s: 12.4,
            },
            coalitions,
        }
    }

    fn arm(combined_power: f64) -> RawProcessor {
        RawProcessor {
            combined_power: Some(combined_power),
            cpu_energy: Some(15.4),
            gpu_energy: Some(4.6),
            ane_energy: Some(0.0),
            ..Default::default()
        }
    }

    #[test]
    fn arm_energy_is_power_times_interval() {
        let mut deriver = Deriver::new(Vec::new());
        let snapshot = deriver.derive(record(2_000_000_000, arm(10.0), vec![])).unwrap();

        assert!(matches!(snapshot.processor, ProcessorReport::Arm { .. }));
        assert_eq!(snapshot.combined_energy_mj, 20);
        assert_eq!(snapshot.cpu_energy_mj, 15);
        assert_eq!(snapshot.gpu_energy_mj, 5);
        assert_eq!(snapshot.ane_energy_mj, 0);
        // 12.4/s over 2s, fractions kept
        assert_eq!(snapshot.energy_impact, 24.8);
    }

    #[test]
    fn intel_energy_is_normalized_to_millijoules() {
        let raw = RawProcessor {
            package_joules: Some(1.25),
            cpu_joules: Some(0.75),
            igpu_watts: Some(0.5),
            ..Default::default()
        };
        let mut deriver = Deriver::new(Vec::new());
        let snapshot = deriver.derive(record(2_000_000_000, raw, vec![])).unwrap();

        assert!(matches!(snapshot.processor, ProcessorReport::Intel { .. }));
        assert_eq!(snapshot.combined_energy_mj, 1250);
        assert_eq!(snapshot.cpu_energy_mj, 750);
        assert_eq!(snapshot.gpu_energy_mj, 1000);
        assert_eq!(snapshot.ane_energy_mj, 0);
    }

    #[test]
    fn negative_counters_clamp_to_zero() {
        let energies = ProcessorReport::Intel {
            package_joules: -1.0,
            cpu_joules: 0.0,
            igpu_watts: 0.0,
        }
        .energies_mj(1.0);
        assert_eq!(energies.combined, 0);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut deriver = Deriver::new(Vec::new());
        assert!(matches!(
            deriver.derive(record(0, arm(10.0), vec![])),
            Err(DeriveError::ZeroInterval)
        ));
    }

    #[test]
    fn missing_counters_are_rejected() {
        let mut deriver = Deriver::new(Vec::new());
        assert!(matches!(
            deriver.derive(record(1_000_000_000, RawProcessor::default(), vec![])),
            Err(DeriveError::MissingProcessorCounters)
        ));
    }

    #[test]
    fn rates_are_scaled_by_interval() {
        let raw = RawEntry {
            name: "Xcode".into(),
            pid: Some(42),
            energy_impact_per_s: 3.0,
            cputime_ms_per_s: 250.0,
            ..Default::default()
        };
        let sample = process_sample(&raw, 4_000_000_000);
        assert_eq!(sample.energy_impact, 12.0);
        assert_eq!(sample.cputime_ns, 1_000_000_000);
        assert_eq!(sample.cputime_per, 25);
        assert_eq!(sample.pid, Some(42));
    }

    #[test]
    fn shell_and_unnamed_coalitions_are_flattened() {
        let mut terminal = entry("com.apple.Terminal", 9.0);
        terminal.tasks = vec![entry("cargo", 5.0), entry("rustc", 4.0)];
        let mut unnamed = entry("  ", 1.0);
        unnamed.tasks = vec![entry("launchd", 1.0)];
        let coalitions = vec![entry("com.apple.Safari", 2.0), terminal, unnamed];

        let shells = Settings::default().shell_coalitions;
        let names: Vec<_> = flatten_coalitions(&coalitions, &shells)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["com.apple.Safari", "cargo", "rustc", "launchd"]);
    }

    #[test]
    fn top_n_orders_by_impact_and_keeps_ties_stable() {
        let processes: Vec<ProcessSample> = (0..20)
            .map(|i| ProcessSample {
                name: format!("p{i}"),
                // p0..p9 tie at 5.0, p10..p19 rank by index
                energy_impact: if i < 10 { 5.0 } else { i as f64 },
                ..Default::default()
            })
            .collect();

        let top = top_n(processes, TOP_N);
        assert_eq!(top.len(), 15);
        let names: Vec<_> = top.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "p19", "p18", "p17", "p16", "p15", "p14", "p13", "p12", "p11", "p10", "p0", "p1",
                "p2", "p3", "p4"
            ]
        );
        assert!(top.windows(2).all(|w| w[0].energy_impact >= w[1].energy_impact));
    }

    #[test]
    fn snapshot_keeps_at_most_top_n_processes() {
        let coalitions = (0..30).map(|i| entry(&format!("c{i}"), i as f64)).collect();
        let mut deriver = Deriver::new(Vec::new());
        let snapshot = deriver
            .derive(record(1_000_000_000, arm(1.0), coalitions))
            .unwrap();
        assert_eq!(snapshot.top_processes.len(), TOP_N);
        assert_eq!(snapshot.top_processes[0].name, "c29");
        assert_eq!(snapshot.grid_intensity, None);
        assert_eq!(snapshot.co2eq_g, None);
    }

    struct OneProcess;

    impl crate::util::ProcessTable for OneProcess {
        fn refresh(&mut self) {}
        fn is_running(&self, _name: &str) -> bool {
            true
        }
        fn other_instances(&self, _name: &str) -> usize {
            0
        }
        fn command_line(&self, pid: u32) -> Option<String> {
            (pid == 412).then(|| "python3 unrelated.py".to_string())
        }
    }

    #[test]
    fn coalition_ids_are_not_used_as_pids() {
        let coalition = RawEntry {
            coalition_id: Some(412),
            ..entry("python3", 2.0)
        };
        let task = RawEntry {
            pid: Some(412),
            ..entry("python3", 1.0)
        };
        let mut deriver = Deriver::new(vec!["Terminal".into()])
            .with_renamer(InterpreterRenamer::new(Box::new(OneProcess)));

        let snapshot = deriver
            .derive(record(1_000_000_000, arm(1.0), vec![coalition]))
            .unwrap();
        assert_eq!(snapshot.top_processes[0].name, "python3");
        assert_eq!(snapshot.top_processes[0].pid, None);

        let terminal = RawEntry {
            tasks: vec![task],
            ..entry("Terminal", 1.0)
        };
        let snapshot = deriver
            .derive(record(1_000_000_000, arm(1.0), vec![terminal]))
            .unwrap();
        assert_eq!(snapshot.top_processes[0].name, "python3 unrelated.py");
        assert_eq!(snapshot.top_processes[0].pid, Some(412));
    }
}
