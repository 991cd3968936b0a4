use std::path::PathBuf;

use chrono::DateTime;
use clap::Parser;
use serde::Serialize;

use powerhog_core::storage::{
    PowerTotals, ProcessTotal, SettingsRecord, Snapshot, Store, TableCounts, decode_snapshot,
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "powerhog-dump", about = "Inspect a powerhog database")]
struct Cli {
    /// Path to the SQLite database
    path: PathBuf,

    /// Decode and print up to N measurement rows still waiting for upload
    #[arg(long, value_name = "N")]
    pending: Option<usize>,

    /// Number of processes in the ranking
    #[arg(long, default_value = "10")]
    top: usize,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    counts: TableCounts,
    settings: Option<SettingsRecord>,
    totals: PowerTotals,
    top_processes: Vec<ProcessTotal>,
    pending: Vec<PendingRow>,
}

#[derive(Serialize)]
struct PendingRow {
    id: i64,
    time: i64,
    snapshot: Option<Snapshot>,
    error: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if !cli.path.is_file() {
        eprintln!("No such database: {}", cli.path.display());
        std::process::exit(1);
    }

    let report = match build_report(&cli) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Cannot read {}: {e}", cli.path.display());
            std::process::exit(1);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Cannot encode report: {e}");
                std::process::exit(1);
            }
        }
    } else {
        print_report(&report);
    }
}

fn build_report(cli: &Cli) -> Result<Report, powerhog_core::storage::StorageError> {
    let store = Store::open(&cli.path)?;
    let pending = match cli.pending {
        Some(limit) => store
            .select_undelivered(limit)?
            .into_iter()
            .map(|row| match decode_snapshot(&row.data) {
                Ok(snapshot) => PendingRow {
                    id: row.id,
                    time: row.time,
                    snapshot: Some(snapshot),
                    error: None,
                },
                Err(e) => PendingRow {
                    id: row.id,
                    time: row.time,
                    snapshot: None,
                    error: Some(e.to_string()),
                },
            })
            .collect(),
        None => Vec::new(),
    };

    Ok(Report {
        counts: store.counts()?,
        settings: store.latest_settings()?,
        totals: store.power_totals()?,
        top_processes: store.top_process_totals(cli.top)?,
        pending,
    })
}

// ── Formatting helpers ───────────────────────────────────────────────────────

fn fmt_ts_ms(ts: i64) -> String {
    DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn human_energy(mj: i64) -> String {
    const J: f64 = 1_000.0;
    const KJ: f64 = 1_000_000.0;
    const WH: f64 = 3_600_000.0;
    let v = mj as f64;
    if v >= 1000.0 * WH {
        format!("{:.2} kWh", v / (1000.0 * WH))
    } else if v >= WH {
        format!("{:.2} Wh", v / WH)
    } else if v >= KJ {
        format!("{:.1} kJ", v / KJ)
    } else if v >= J {
        format!("{:.1} J", v / J)
    } else {
        format!("{mj} mJ")
    }
}

fn print_report(report: &Report) {
    let c = &report.counts;
    println!("── Tables ──");
    println!("  measurements        {:>10}", c.measurements);
    println!("  power_measurements  {:>10}", c.power_measurements);
    println!("  top_processes       {:>10}", c.top_processes);
    println!("  settings            {:>10}", c.settings);

    println!();
    println!("── Settings ──");
    match &report.settings {
        Some(s) => {
            println!("  machine_uuid   {}", s.machine_uuid);
            println!("  recorded       {}", fmt_ts_ms(s.time));
            println!("  powermetrics   {} ms", s.powermetrics);
            println!("  upload_delta   {} s", s.upload_delta);
            println!("  upload_data    {}", s.upload_data);
            println!("  api_url        {}", s.api_url);
        }
        None => println!("  (none)"),
    }

    let t = &report.totals;
    println!();
    println!("── Energy ──");
    if let (Some(first), Some(last)) = (t.first_time, t.last_time) {
        println!("  range          {} .. {}", fmt_ts_ms(first), fmt_ts_ms(last));
    }
    println!("  combined       {}", human_energy(t.combined_energy_mj));
    println!("  cpu            {}", human_energy(t.cpu_energy_mj));
    println!("  gpu            {}", human_energy(t.gpu_energy_mj));
    println!("  ane            {}", human_energy(t.ane_energy_mj));
    println!("  energy impact  {:.0}", t.energy_impact);
    println!("  co2eq          {:.3} g", t.co2eq_g);

    if !report.top_processes.is_empty() {
        println!();
        println!("── Top processes ──");
        for p in &report.top_processes {
            println!("  {:>12.1}  {:>8}  {}", p.energy_impact, p.samples, p.name);
        }
    }

    if !report.pending.is_empty() {
        println!();
        println!("── Pending upload ──");
        for row in &report.pending {
            match (&row.snapshot, &row.error) {
                (Some(s), _) => println!(
                    "  #{:<8} {}  {} combined, impact {:.0}, {} processes",
                    row.id,
                    fmt_ts_ms(row.time),
                    human_energy(s.combined_energy_mj),
                    s.energy_impact,
                    s.top_processes.len()
                ),
                (None, Some(e)) => println!("  #{:<8} {}  undecodable: {e}", row.id, fmt_ts_ms(row.time)),
                (None, None) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_units_scale() {
        assert_eq!(human_energy(500), "500 mJ");
        assert_eq!(human_energy(1_500), "1.5 J");
        assert_eq!(human_energy(2_500_000), "2.5 kJ");
        assert_eq!(human_energy(7_200_000), "2.00 Wh");
        assert_eq!(human_energy(3_600_000_000), "1.00 kWh");
    }

    #[test]
    fn timestamps_are_utc() {
        assert_eq!(fmt_ts_ms(1_694_332_800_000), "2023-09-10 08:00:00");
    }
}
