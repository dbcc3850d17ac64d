//! # recall-dump
//!
//! A CLI tool that snapshots the local Windows Recall capture store into a
//! self-contained folder and lists the captured windows.
//!
//! ## What it does
//!
//! Recall keeps its data under
//! `C:\Users\<user>\AppData\Local\CoreAIPlatform.00\UKP\<GUID>\`: a SQLite
//! database (`ukg.db`) and an `ImageStore` directory of extension-less
//! screenshots. This tool checks the store is there, tries to grant the current
//! user access to it, copies both into a fresh `YYYY-MM-DD-HH-MM_Extraction`
//! folder, appends `.jpg` to the copied screenshots so image viewers open them,
//! and prints the `WindowCapture` table from the **copy**.
//!
//! The live store is only ever read. The extraction folder is never rolled
//! back: if a run fails halfway, whatever was copied stays for inspection.
//!
//! ## Usage
//!
//! ```sh
//! # Extract the current user's store into the working directory
//! recall-dump
//!
//! # Offline: a mounted disk image, another account, no prompt
//! recall-dump --profiles-dir /mnt/evidence/Users --user alice --yes -o ./case-17
//!
//! # Only list captures from one day whose title mentions "Bank"
//! recall-dump -f 2024-06-01 -t 2024-06-01 -s Bank
//! ```
//!
//! ## Library
//!
//! [`pipeline::run`] drives a whole extraction. It never prints: progress
//! comes out as [`events::Event`]s and every ending has an
//! [`error::OutcomeTag`] so callers can tell them apart without parsing text.
pub mod copier;
pub mod error;
pub mod events;
pub mod normalize;
pub mod paths;
pub mod pipeline;
pub mod platform;
pub mod records;

pub use error::{ExtractError, OutcomeTag};
pub use pipeline::{Completion, ExtractConfig, ExtractionReport, PipelineFailure};
