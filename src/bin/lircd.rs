use clap::Parser;
use lircd::{
    daemon::Daemon,
    hardware,
    options::{Args, Options},
    Error,
};
use std::{path::PathBuf, process};

fn main() {
    let args = Args::parse();

    lircd::log::init(args.verbose, args.quiet);

    if let Err(e) = run(&args) {
        eprintln!("lircd: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let mut options = Options::from_args(args)?;

    if options.driver.eq_ignore_ascii_case("help") || options.driver == "?" {
        println!("Supported drivers:\n{}", hardware::driver_list());
        return Ok(());
    }

    options.driver = hardware::find_driver(&options.driver)?.to_owned();

    let device = options.device().unwrap_or_else(|| PathBuf::from("/dev/null"));

    let hardware = hardware::open(&options.driver, &device)?;

    let mut daemon = Daemon::new(&options, hardware)?;

    daemon.handle_signals()?;

    daemon.run()
}
