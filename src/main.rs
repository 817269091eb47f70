//! Thin CLI front-end: `rv64-system-emu <kernel.elf> [disk.img]`.
//!
//! Positional argument parsing only, no flag/subcommand parser; terminal
//! raw-mode negotiation is likewise out of scope, so stdin is relayed
//! through a background reader thread rather than put into raw mode.

use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use rv64_system_emu::devices::uart::HostIo;
use rv64_system_emu::{MachineConfig, System};

struct StdioHost {
    rx: mpsc::Receiver<u8>,
}

impl StdioHost {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut byte = [0u8; 1];
            let mut stdin = io::stdin();
            loop {
                match stdin.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(byte[0]).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Self { rx }
    }
}

impl HostIo for StdioHost {
    fn write(&mut self, byte: u8) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }

    fn read_nonblocking(&mut self) -> Option<u8> {
        self.rx.try_recv().ok()
    }
}

fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let kernel_path = args.next().ok_or("usage: rv64-system-emu <kernel.elf> [disk.img]")?;
    let disk_path = args.next();

    let kernel = fs::read(&kernel_path).map_err(|e| format!("reading {kernel_path}: {e}"))?;
    let disk = match disk_path {
        Some(path) => fs::read(&path).map_err(|e| format!("reading {path}: {e}"))?,
        None => Vec::new(),
    };

    let config = MachineConfig::default();
    let mut system =
        System::new(&config, disk, Box::new(StdioHost::new())).map_err(|e| e.to_string())?;
    system.load_kernel(&kernel).map_err(|e| e.to_string())?;
    system.run_until_halted();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
