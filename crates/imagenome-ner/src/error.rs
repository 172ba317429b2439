use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexiconError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lexicon line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("lexicon is empty")]
    Empty,

    #[error("automaton build failed: {0}")]
    Build(String),
}

impl From<aho_corasick::BuildError> for LexiconError {
    fn from(e: aho_corasick::BuildError) -> Self {
        LexiconError::Build(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LexiconError>;
