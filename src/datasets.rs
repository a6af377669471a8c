//! Built-in datasets for easy testing and experimentation.
#[cfg(feature = "csv")]
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::data::RatingEntry;
use super::Score;

/// Probabilities of drawing scores 1 through 5, followed by the
/// probability of leaving a cell unrated.
const SYNTHETIC_WEIGHTS: [f64; 6] = [0.15, 0.15, 0.2, 0.2, 0.2, 0.1];

/// Five users rating five movies.
///
/// Ana rated Matrix, Titanic and Avatar; every other user rated three
/// movies too, except Eduarda who rated two.
pub fn movies() -> Vec<RatingEntry> {
    let ratings: [(&str, &str, Score); 14] = [
        ("Ana", "Matrix", 5.0),
        ("Ana", "Titanic", 4.0),
        ("Ana", "Avatar", 4.0),
        ("Bruno", "Matrix", 5.0),
        ("Bruno", "Avatar", 4.0),
        ("Bruno", "Vingadores", 4.0),
        ("Carla", "Titanic", 5.0),
        ("Carla", "Avatar", 4.0),
        ("Carla", "Interestelar", 5.0),
        ("Daniel", "Matrix", 4.0),
        ("Daniel", "Interestelar", 5.0),
        ("Daniel", "Vingadores", 5.0),
        ("Eduarda", "Vingadores", 5.0),
        ("Eduarda", "Interestelar", 4.0),
    ];

    ratings
        .iter()
        .map(|&(user_id, item_id, score)| RatingEntry::new(user_id, item_id, score))
        .collect()
}

fn draw_score<R: Rng>(rng: &mut R) -> Option<Score> {
    let draw: f64 = rng.gen();
    let mut cumulative = 0.0;

    for (idx, weight) in SYNTHETIC_WEIGHTS.iter().enumerate() {
        cumulative += weight;

        if draw < cumulative {
            return if idx < 5 {
                Some((idx + 1) as Score)
            } else {
                None
            };
        }
    }

    None
}

/// A dense synthetic dataset of `num_users` by `num_items` cells.
///
/// Every cell is a score from 1 to 5 or an explicit unrated marker,
/// drawn from a generator seeded with `seed`: the same seed always
/// yields the same entries. Users are named `user_{u}` and items
/// `item_{i}`.
pub fn synthetic(num_users: usize, num_items: usize, seed: u64) -> Vec<RatingEntry> {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut entries = Vec::with_capacity(num_users * num_items);

    for user in 0..num_users {
        for item in 0..num_items {
            let user_id = format!("user_{}", user);
            let item_id = format!("item_{}", item);

            entries.push(match draw_score(&mut rng) {
                Some(score) => RatingEntry::new(user_id, item_id, score),
                None => RatingEntry::unrated(user_id, item_id),
            });
        }
    }

    entries
}

/// Read rating entries from a CSV file with a `user_id,item_id,score`
/// header. An empty `score` field marks the pair as unrated.
#[cfg(feature = "csv")]
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Vec<RatingEntry>, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let entries: Vec<RatingEntry> = reader.deserialize().collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}
