//! Command-line argument parsing for Mithra

/// What the process should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the SIP registration client until signalled
    Run,
    /// Inspect the liveness sentinel and exit 0/1
    Check,
    /// Run the UDP relay
    Proxy,
}

pub struct Args {
    pub command: Command,
    pub validate: bool,
    pub help: bool,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    parse(&args)
}

fn parse(args: &[String]) -> Args {
    let mut result = Args {
        command: Command::Run,
        validate: false,
        help: false,
    };

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "check" => result.command = Command::Check,
            "proxy" => result.command = Command::Proxy,
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            _ => {}
        }
    }

    result
}

pub fn print_help() {
    println!("Mithra - caller-ID ingestion service\n");
    println!("USAGE:");
    println!("    mithra [COMMAND] [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    (none)       Run the SIP registration client until signalled");
    println!("    check        Check the liveness sentinel (exit 0 healthy, 1 stale)");
    println!("    proxy        Run the UDP relay in front of the SIP server\n");
    println!("OPTIONS:");
    println!("    --validate   Validate configuration and exit");
    println!("    --help, -h   Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    APP_SIP_HOST, APP_SIP_PORT, APP_SIP_USERNAME, APP_SIP_PASSWORD,");
    println!("    APP_CACHE_DIR, APP_SENTINEL_FILE, APP_REGISTER_EXPIRES, APP_PROXY_HOST");
}
