use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    shardstream::example_apps::run_mixing_demo(std::env::args().skip(1))
}
