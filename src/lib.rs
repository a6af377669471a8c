#![deny(missing_docs)]
//! # cofi
//!
//! `cofi` implements neighbourhood-based collaborative filtering: given a
//! sparse table of user ratings, it imputes and standardises the ratings,
//! computes cosine similarities between users (or items) in parallel, and
//! turns the neighbourhood of a user into a ranked list of recommendations.
//!
//! ## Example
//! Fitting a user-based model on the bundled movie fixture:
//!
//! ```rust
//! # extern crate cofi;
//! use cofi::pipeline::{Config, Pipeline};
//! use cofi::recommendation::Recommendations;
//! use cofi::similarity::Axis;
//!
//! let config = Config::new()
//!     .axis(Axis::User)
//!     .top_k(2)
//!     .top_n(3)
//!     .num_threads(2);
//!
//! let model = Pipeline::new(config)
//!     .fit(cofi::datasets::movies())
//!     .unwrap();
//!
//! match model.recommend("Ana").unwrap() {
//!     Recommendations::Ranked(list) => {
//!         for recommendation in list.iter() {
//!             assert!(!["Matrix", "Titanic", "Avatar"].contains(&recommendation.item_id.as_str()));
//!         }
//!     }
//!     Recommendations::Empty => println!("Nothing left to recommend."),
//! }
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[cfg(feature = "csv")]
extern crate csv;
#[macro_use]
extern crate failure;
extern crate ndarray;
extern crate rand;
extern crate rand_xorshift;
extern crate rayon;
extern crate serde;
#[macro_use]
extern crate tracing;

pub mod data;
pub mod datasets;
pub mod pipeline;
pub mod preprocessing;
pub mod recommendation;
pub mod similarity;

/// Alias for user identifiers.
pub type UserId = String;
/// Alias for item identifiers.
pub type ItemId = String;
/// Alias for rating values.
pub type Score = f64;
