//! Stateful stand-in for the LVM, tgt and sysstat tools of a dock host.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libtarget::{Executor, TargetError};

#[derive(Debug, Clone)]
struct Vg {
    name: String,
    size: f64,
    uuid: String,
}

#[derive(Debug, Clone)]
struct Lv {
    vg: String,
    name: String,
    size: f64,
    /// Origin `vg/name` for snapshots.
    origin: Option<String>,
}

#[derive(Default)]
struct State {
    vgs: Vec<Vg>,
    lvs: Vec<Lv>,
    calls: Vec<String>,
}

/// Answers `lvcreate`, `lvs`, `lvremove`, `lvextend`, `vgs`, `pvs`, `sar` and
/// `tgt-admin` from in-memory state and records every command line.
pub struct FakeHost {
    tgt_dir: PathBuf,
    state: Mutex<State>,
}

fn flag<'a>(args: &[&'a str], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == name)
        .and_then(|i| args.get(i + 1).copied())
}

fn gib(size: &str) -> f64 {
    size.trim_end_matches('g').parse().unwrap_or(0.0)
}

impl FakeHost {
    pub fn new(tgt_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            tgt_dir,
            state: Mutex::new(State::default()),
        })
    }

    pub fn add_vg(&self, name: &str, size: f64, uuid: &str) {
        self.state.lock().unwrap().vgs.push(Vg {
            name: name.to_owned(),
            size,
            uuid: uuid.to_owned(),
        });
    }

    /// Command lines starting with `program`.
    pub fn calls(&self, program: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(program))
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn has_lv(&self, vg: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .lvs
            .iter()
            .any(|lv| lv.vg == vg && lv.name == name)
    }

    pub fn lv_size(&self, vg: &str, name: &str) -> Option<f64> {
        self.state
            .lock()
            .unwrap()
            .lvs
            .iter()
            .find(|lv| lv.vg == vg && lv.name == name)
            .map(|lv| lv.size)
    }

    fn attr(state: &State, lv: &Lv) -> &'static str {
        if lv.origin.is_some() {
            return "swi-a-s---";
        }
        let key = format!("{}/{}", lv.vg, lv.name);
        if state.lvs.iter().any(|s| s.origin.as_deref() == Some(&key)) {
            "owi-a-s---"
        } else {
            "-wi-a-----"
        }
    }

    fn lvs(state: &State, vg: Option<&str>) -> String {
        state
            .lvs
            .iter()
            .filter(|lv| vg.is_none_or(|vg| lv.vg == vg))
            .map(|lv| format!("  {} {} {:.2} {}\n", lv.vg, lv.name, lv.size, Self::attr(state, lv)))
            .collect()
    }

    fn vgs(state: &State) -> String {
        state
            .vgs
            .iter()
            .map(|vg| {
                let used: f64 = state.lvs.iter().filter(|lv| lv.vg == vg.name).map(|lv| lv.size).sum();
                format!("  {} {:.2} {:.2} {}\n", vg.name, vg.size, vg.size - used, vg.uuid)
            })
            .collect()
    }

    fn sar(state: &State) -> String {
        let mut out = String::from(
            "Average:          DEV       tps     rkB/s     wkB/s   areq-sz    aqu-sz     await     svctm     %util\n",
        );
        out.push_str("Average:          sda      5.00     20.00     40.00     12.00      0.01      2.00      1.00      0.40\n");
        for lv in &state.lvs {
            let dm = format!("{}-{}", lv.vg.replace('-', "--"), lv.name.replace('-', "--"));
            out.push_str(&format!(
                "Average:    {dm}      2.00      8.00      4.00      4.00      0.00      0.50      0.25      0.05\n"
            ));
        }
        out
    }

    /// `tgt-admin --show` listing one target per config file present.
    fn tgt_show(&self) -> String {
        let Ok(entries) = std::fs::read_dir(&self.tgt_dir) else {
            return String::new();
        };
        let mut out = String::new();
        for (tid, entry) in entries.flatten().enumerate() {
            let conf = std::fs::read_to_string(entry.path()).unwrap_or_default();
            let value = |key: &str| {
                conf.lines()
                    .map(str::trim)
                    .find_map(|l| l.strip_prefix(key).map(str::trim).map(str::to_owned))
                    .unwrap_or_default()
            };
            let iqn = value("<target").trim_end_matches('>').to_owned();
            let backing = value("backing-store");
            out.push_str(&format!(
                "Target {}: {iqn}\n    LUN information:\n        LUN: 1\n            Backing store path: {backing}\n",
                tid + 1
            ));
        }
        out
    }
}

#[async_trait]
impl Executor for FakeHost {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, TargetError> {
        let cmdline = format!("{program} {}", args.join(" "));
        let mut state = self.state.lock().unwrap();
        state.calls.push(cmdline.clone());

        match program {
            "lvcreate" => {
                let name = flag(args, "-n").unwrap_or_default().to_owned();
                let size = gib(flag(args, "-L").unwrap_or_default());
                let (vg, origin) = match flag(args, "-s") {
                    Some(origin) => (origin.split('/').next().unwrap_or_default().to_owned(), Some(origin.to_owned())),
                    None => (args.last().copied().unwrap_or_default().to_owned(), None),
                };
                if state.lvs.iter().any(|lv| lv.vg == vg && lv.name == name) {
                    return Err(TargetError::command(cmdline, format!("{name} already exists")));
                }
                state.lvs.push(Lv { vg, name, size, origin });
                Ok(String::new())
            }
            "lvs" => {
                let vg = args.last().filter(|a| !a.starts_with('-') && !a.contains(','));
                Ok(Self::lvs(&state, vg.copied()))
            }
            "lvremove" => {
                let target = args.last().copied().unwrap_or_default();
                let before = state.lvs.len();
                state.lvs.retain(|lv| format!("{}/{}", lv.vg, lv.name) != target);
                if state.lvs.len() == before {
                    return Err(TargetError::command(cmdline, "not found"));
                }
                Ok(String::new())
            }
            "lvextend" => {
                let size = gib(flag(args, "-L").unwrap_or_default());
                let target = args.last().copied().unwrap_or_default();
                match state.lvs.iter_mut().find(|lv| format!("{}/{}", lv.vg, lv.name) == target) {
                    Some(lv) => {
                        lv.size = size;
                        Ok(String::new())
                    }
                    None => Err(TargetError::command(cmdline, "not found")),
                }
            }
            "vgs" => Ok(Self::vgs(&state)),
            "pvs" => Ok("  /dev/sda\n".to_owned()),
            "sar" => Ok(Self::sar(&state)),
            "lvchange" | "udevadm" => Ok(String::new()),
            "tgt-admin" => {
                drop(state);
                if args == ["--show"] {
                    Ok(self.tgt_show())
                } else {
                    Ok(String::new())
                }
            }
            _ => Err(TargetError::command(cmdline, "unexpected command")),
        }
    }
}
