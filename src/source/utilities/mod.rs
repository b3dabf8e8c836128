/// Entry-to-sample grouping.
pub mod grouping;
