//! Pipeline module - Multi-persona stage sequencing
//!
//! Every task item runs through the same stages:
//!
//! - **Switch**: the arbiter proposes persona groups and a decider
//! - **Collaborative**: each group's researcher and thinker run concurrently
//! - **Minimux**: the decider arbitrates the group outputs into a payload
//! - **Guesser**: word-link only, turns the final clue into board guesses
//!
//! # Example
//!
//! ```rust,ignore
//! use mpllm::pipeline::Sequencer;
//!
//! let sequencer = Sequencer::from_config(&config, client)?;
//! let output = sequencer.run("recall-and-write", &item).await?;
//! println!("{:?}", output.payload);
//! ```

pub mod outcome;
pub mod sequencer;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;

pub use outcome::{GroupOutcome, PipelineOutput};
pub use sequencer::{Sequencer, SequencerBuilder, ARBITRATION_GUESS_FIELD};
pub use stage::Stage;
