extern crate cofi;
extern crate failure;
extern crate tracing_subscriber;

use std::env;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

use cofi::datasets;
use cofi::pipeline::{Config, Pipeline};
use cofi::recommendation::Recommendations;
use cofi::similarity::Axis;

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let user = env::args().nth(1).unwrap_or_else(|| "user_0".to_owned());
    let data = match env::args().nth(2) {
        Some(path) => datasets::load_csv(path)?,
        None => datasets::synthetic(1000, 100, 42),
    };

    let config = Config::new()
        .axis(Axis::User)
        .top_k(5)
        .top_n(5)
        .num_threads(6);

    println!("Computing similarities in parallel...");

    let start = Instant::now();
    let model = Pipeline::new(config).fit(data)?;

    println!(
        "Users {} items {} (in {:?})",
        model.ratings().num_users(),
        model.ratings().num_items(),
        start.elapsed()
    );

    match model.recommend(&user)? {
        Recommendations::Ranked(list) => {
            println!("Recommendations for {}:", user);
            for recommendation in &list {
                println!("{:>12} {:.2}", recommendation.item_id, recommendation.score);
            }
        }
        Recommendations::Empty => println!("No recommendations available for {}.", user),
    }

    Ok(())
}
