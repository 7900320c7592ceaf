#[tokio::main]
async fn main() {
    if let Err(err) = gssg::app::run().await {
        eprintln!("gssg: {err:#}");
        std::process::exit(2);
    }
}
