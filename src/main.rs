use std::process;

use log::info;

use cortado::cli::Cli;
use cortado::runtime::Runtime;

fn main() {
    let cli = Cli::from_env();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let classpath = cli.classpath();
    info!(
        "cortado {} running {} (classpath {:?})",
        env!("CARGO_PKG_VERSION"),
        cli.main_class,
        classpath.roots()
    );

    let mut runtime = Runtime::new(Box::new(classpath), cli.settings());
    if let Err(err) = runtime.start(&cli.main_class, &cli.args) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
