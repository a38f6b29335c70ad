use clap::Parser;

fn main() {
    let cli = flockwatchctl::Cli::parse();
    if let Err(err) = flockwatchctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
