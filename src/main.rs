use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use kestrel::devices::NetTransport;
use kestrel::{loader, System};
use log::error;

const DEFAULT_RAM_MB: u32 = 128;
const TICK_BATCH: u32 = 10_000;

/// Restores the original termios settings when dropped.
struct RawTerminal {
    saved: libc::termios,
}

impl RawTerminal {
    /// Put the terminal in raw-ish mode: no echo, no line buffering, but
    /// keep ISIG so Ctrl+C still kills the emulator.
    fn enable() -> Option<Self> {
        unsafe {
            let fd = libc::STDIN_FILENO;
            if libc::isatty(fd) == 0 {
                return None;
            }
            let mut saved: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut saved) != 0 {
                return None;
            }
            let mut raw = saved;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_iflag &= !(libc::IXON | libc::ICRNL);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;
            libc::tcsetattr(fd, libc::TCSANOW, &raw);
            Some(RawTerminal { saved })
        }
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.saved);
        }
    }
}

fn set_stdin_nonblocking(enable: bool) {
    unsafe {
        let flags = libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL);
        let flags = if enable {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags);
    }
}

fn show_help(program: &str) {
    eprintln!("Usage: {} [options]", program);
    eprintln!("  -n              headless mode (default; accepted for compatibility)");
    eprintln!("  -b <image>      load a raw RAM image at 0x80000000");
    eprintln!("  -e <file>       load an ELF32 image");
    eprintln!("  -d <file>       load a device tree blob at 0x1020");
    eprintln!("  -f <file>       load an MTD (initrd/flash) image at 0x40000000");
    eprintln!("  -m <MiB>        RAM size in MiB (default {})", DEFAULT_RAM_MB);
    eprintln!("  -s              single-step trace of every instruction");
    eprintln!("  --net <path>    connect to a network peer on a Unix socket");
    eprintln!("  --net-listen <path>  listen for a network peer");
    eprintln!("  --test-exit     let guest ECALL (a7=93) terminate the emulator");
}

struct Options {
    bin_path: Option<String>,
    elf_path: Option<String>,
    dtb_path: Option<String>,
    mtd_path: Option<String>,
    ram_size_mb: u32,
    single_step: bool,
    net_connect: Option<String>,
    net_listen: Option<String>,
    test_exit: bool,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options {
        bin_path: None,
        elf_path: None,
        dtb_path: None,
        mtd_path: None,
        ram_size_mb: DEFAULT_RAM_MB,
        single_step: false,
        net_connect: None,
        net_listen: None,
        test_exit: false,
    };

    let mut i = 1;
    while i < args.len() {
        let take_value = |i: &mut usize| -> Result<String, String> {
            *i += 1;
            args.get(*i)
                .cloned()
                .ok_or_else(|| format!("{} requires a value", args[*i - 1]))
        };
        match args[i].as_str() {
            "-h" | "--help" => return Err(String::new()),
            "-n" => {}
            "-b" => opts.bin_path = Some(take_value(&mut i)?),
            "-e" => opts.elf_path = Some(take_value(&mut i)?),
            "-d" => opts.dtb_path = Some(take_value(&mut i)?),
            "-f" => opts.mtd_path = Some(take_value(&mut i)?),
            "-m" => {
                let value = take_value(&mut i)?;
                opts.ram_size_mb = value
                    .parse()
                    .map_err(|_| format!("invalid RAM size: {}", value))?;
            }
            "-s" => opts.single_step = true,
            "--net" => opts.net_connect = Some(take_value(&mut i)?),
            "--net-listen" => opts.net_listen = Some(take_value(&mut i)?),
            "--test-exit" => opts.test_exit = true,
            other => return Err(format!("unknown argument: {}", other)),
        }
        i += 1;
    }

    if opts.bin_path.is_none() && opts.elf_path.is_none() {
        return Err("no guest image: pass -b <image> or -e <file>".to_string());
    }
    Ok(opts)
}

fn build_system(opts: &Options) -> Result<System, String> {
    let mut system = System::new(opts.ram_size_mb);
    system.trace = opts.single_step;
    system.cpu.allow_guest_exit = opts.test_exit;

    if let Some(path) = &opts.bin_path {
        let data = fs::read(path).map_err(|e| format!("{}: {}", path, e))?;
        loader::load_raw(&mut system.bus, &data).map_err(|e| e.to_string())?;
    }
    if let Some(path) = &opts.elf_path {
        let data = fs::read(path).map_err(|e| format!("{}: {}", path, e))?;
        loader::load_elf(&mut system.bus, &data).map_err(|e| e.to_string())?;
    }
    if let Some(path) = &opts.dtb_path {
        let data = fs::read(path).map_err(|e| format!("{}: {}", path, e))?;
        loader::load_dtb(&mut system.bus, &data).map_err(|e| e.to_string())?;
    }
    if let Some(path) = &opts.mtd_path {
        let data = fs::read(path).map_err(|e| format!("{}: {}", path, e))?;
        loader::load_mtd(&mut system.bus, &data).map_err(|e| e.to_string())?;
    }

    if let Some(path) = &opts.net_listen {
        let transport = NetTransport::listen(path).map_err(|e| format!("{}: {}", path, e))?;
        system.bus.net.attach(transport);
    } else if let Some(path) = &opts.net_connect {
        let transport = NetTransport::connect(path).map_err(|e| format!("{}: {}", path, e))?;
        system.bus.net.attach(transport);
    }

    Ok(system)
}

/// Pump stdin into the UART, with CR folded to LF for the guest console.
fn pump_stdin(system: &mut System) {
    let mut buf = [0u8; 16];
    let n = unsafe { libc::read(0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        for &byte in &buf[..n as usize] {
            system.uart_input(if byte == b'\r' { b'\n' } else { byte });
        }
    }
}

fn run(system: &mut System) -> io::Result<u32> {
    let mut stdout = io::stdout();
    loop {
        pump_stdin(system);
        system.poll_net();

        let (_, exit) = system.run(TICK_BATCH);

        let output = system.uart_output();
        if !output.is_empty() {
            stdout.write_all(&output)?;
            stdout.flush()?;
        }

        if let Some(status) = exit {
            return Ok(status);
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("{}", message);
            }
            show_help(&args[0]);
            return ExitCode::from(if message.is_empty() { 0 } else { 1 });
        }
    };

    let mut logger = env_logger::Builder::from_default_env();
    if opts.single_step {
        logger.filter_level(log::LevelFilter::Trace);
    }
    logger.init();

    let mut system = match build_system(&opts) {
        Ok(system) => system,
        Err(message) => {
            error!("{}", message);
            return ExitCode::from(1);
        }
    };

    let _terminal = RawTerminal::enable();
    set_stdin_nonblocking(true);

    let result = run(&mut system);
    set_stdin_nonblocking(false);

    if system.trace {
        system.cpu.dump();
    }

    match result {
        Ok(status) => ExitCode::from(status.min(255) as u8),
        Err(e) => {
            error!("I/O error: {}", e);
            ExitCode::from(1)
        }
    }
}
