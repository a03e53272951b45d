pub mod global_variables;
pub mod transport;
pub mod vlaanderen;
