mod actions;
mod cli;
mod config;
mod detector;
mod input;
mod ipc;
mod logging;
mod replay;
mod sample;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
