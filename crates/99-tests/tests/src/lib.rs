//! Cross-crate scenarios for the module bridge, run against both embeddings.

#[cfg(test)]
mod harness;

#[cfg(test)]
mod scenarios;

#[cfg(test)]
mod process_init;
