use human_panic::setup_panic;
use pacer::cli;

#[tokio::main]
async fn main() {
    setup_panic!();

    let cli = match cli::Cli::new() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            std::process::exit(1)
        }
    };

    if let Err(e) = cli.run().await {
        eprintln!("Error: {:?}", e);
        std::process::exit(1)
    }
}
