//! Interpreter renaming.
//!
//! powermetrics reports scripts by their interpreter (`python3`, `node`, ...),
//! which makes every script look the same. [`InterpreterRenamer`] swaps such
//! names for the process command line. The process table is refreshed at most
//! once per [`REFRESH_THROTTLE`]; resolved names are cached per pid for the
//! same window, so a reused pid picks up its new command line.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::storage::model::ProcessSample;
use crate::util::ProcessTable;

pub const REFRESH_THROTTLE: Duration = Duration::from_secs(60);

/// Names that say nothing about what is actually running.
pub const INTERPRETERS: &[&str] = &[
    "python", "python3", "node", "ruby", "perl", "java", "bash", "sh", "zsh", "php",
];

pub fn is_interpreter(name: &str) -> bool {
    INTERPRETERS.contains(&name)
}

pub struct InterpreterRenamer {
    table: Box<dyn ProcessTable>,
    last_refresh: Option<Instant>,
    /// Resolved name and when it was looked up.
    cache: HashMap<i64, (String, Instant)>,
}

impl InterpreterRenamer {
    pub fn new(table: Box<dyn ProcessTable>) -> Self {
        Self {
            table,
            last_refresh: None,
            cache: HashMap::new(),
        }
    }

    /// Renames interpreter entries in place. Entries without a pid, or whose
    /// process is gone, keep their name.
    pub fn rename(&mut self, processes: &mut [ProcessSample]) {
        self.rename_at(processes, Instant::now());
    }

    fn rename_at(&mut self, processes: &mut [ProcessSample], now: Instant) {
        for process in processes.iter_mut() {
            if !is_interpreter(&process.name) {
                continue;
            }
            let Some(pid) = process.pid else { continue };

            match self.cache.get(&pid) {
                Some((name, at)) if now.duration_since(*at) < REFRESH_THROTTLE => {
                    process.name = name.clone();
                    continue;
                }
                Some(_) => {
                    self.cache.remove(&pid);
                }
                None => {}
            }

            self.refresh_if_due(now);
            let Ok(raw_pid) = u32::try_from(pid) else { continue };
            if let Some(cmd) = self.table.command_line(raw_pid) {
                debug!(pid, from = %process.name, to = %cmd, "renamed interpreter process");
                self.cache.insert(pid, (cmd.clone(), now));
                process.name = cmd;
            }
        }
    }

    fn refresh_if_due(&mut self, now: Instant) {
        let due = self
            .last_refresh
            .is_none_or(|at| now.duration_since(at) >= REFRESH_THROTTLE);
        if due {
            self.table.refresh();
            self.last_refresh = Some(now);
            // pids may have been reused since the last refresh
            self.cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeTable {
        commands: Arc<Mutex<HashMap<u32, String>>>,
        refreshes: Arc<Mutex<u32>>,
    }

    impl ProcessTable for FakeTable {
        fn refresh(&mut self) {
            *self.refreshes.lock().unwrap() += 1;
        }
        fn is_running(&self, _name: &str) -> bool {
            true
        }
        fn other_instances(&self, _name: &str) -> usize {
            0
        }
        fn command_line(&self, pid: u32) -> Option<String> {
            self.commands.lock().unwrap().get(&pid).cloned()
        }
    }

    fn sample(name: &str, pid: Option<i64>) -> ProcessSample {
        ProcessSample {
            name: name.into(),
            pid,
            ..Default::default()
        }
    }

    type Commands = Arc<Mutex<HashMap<u32, String>>>;

    fn renamer() -> (InterpreterRenamer, Arc<Mutex<u32>>, Commands) {
        let table = FakeTable {
            commands: Arc::new(Mutex::new(HashMap::from([
                (10, "python3 manage.py runserver".to_string()),
                (11, "node server.js".to_string()),
            ]))),
            ..Default::default()
        };
        let refreshes = table.refreshes.clone();
        let commands = table.commands.clone();
        (InterpreterRenamer::new(Box::new(table)), refreshes, commands)
    }

    #[test]
    fn interpreters_get_their_command_line() {
        let (mut renamer, _, _) = renamer();
        let mut processes = vec![
            sample("python3", Some(10)),
            sample("Safari", Some(11)),
            sample("node", Some(11)),
            sample("ruby", Some(99)),
            sample("perl", None),
        ];
        renamer.rename(&mut processes);

        let names: Vec<_> = processes.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            ["python3 manage.py runserver", "Safari", "node server.js", "ruby", "perl"]
        );
    }

    #[test]
    fn refresh_is_throttled() {
        let (mut renamer, refreshes, _) = renamer();
        let t0 = Instant::now();

        renamer.rename_at(&mut [sample("ruby", Some(98))], t0);
        renamer.rename_at(&mut [sample("ruby", Some(99))], t0 + Duration::from_secs(5));
        assert_eq!(*refreshes.lock().unwrap(), 1);

        renamer.rename_at(&mut [sample("ruby", Some(99))], t0 + REFRESH_THROTTLE);
        assert_eq!(*refreshes.lock().unwrap(), 2);
    }

    #[test]
    fn cached_names_skip_the_table() {
        let (mut renamer, refreshes, commands) = renamer();
        let t0 = Instant::now();
        renamer.rename_at(&mut [sample("python3", Some(10))], t0);
        commands.lock().unwrap().clear();

        let mut again = [sample("python3", Some(10))];
        renamer.rename_at(&mut again, t0 + Duration::from_secs(5));
        assert_eq!(again[0].name, "python3 manage.py runserver");
        assert_eq!(*refreshes.lock().unwrap(), 1);
    }

    #[test]
    fn reused_pid_is_looked_up_again_after_the_window() {
        let (mut renamer, refreshes, commands) = renamer();
        let t0 = Instant::now();
        renamer.rename_at(&mut [sample("python3", Some(10))], t0);

        // pid 10 exits and is handed to a different script
        commands
            .lock()
            .unwrap()
            .insert(10, "python3 train.py --epochs 3".to_string());

        // the entry stays hot for the whole window
        for secs in [10, 30, 59] {
            let mut hot = [sample("python3", Some(10))];
            renamer.rename_at(&mut hot, t0 + Duration::from_secs(secs));
            assert_eq!(hot[0].name, "python3 manage.py runserver");
        }

        let mut later = [sample("python3", Some(10))];
        renamer.rename_at(&mut later, t0 + REFRESH_THROTTLE);
        assert_eq!(later[0].name, "python3 train.py --epochs 3");
        assert_eq!(*refreshes.lock().unwrap(), 2);
    }

    #[test]
    fn coalition_named_like_an_interpreter_is_left_alone() {
        let (mut renamer, refreshes, _) = renamer();
        // a coalition id is not a pid, even when a process with that pid exists
        let mut processes = [sample("python3", None)];
        renamer.rename(&mut processes);
        assert_eq!(processes[0].name, "python3");
        assert_eq!(*refreshes.lock().unwrap(), 0);
    }
}
