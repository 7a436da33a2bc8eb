use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad token at line {line}, column {col}")]
    Lex { line: usize, col: usize },
    #[error("unterminated array at line {line}, column {col}")]
    UnterminatedArray { line: usize, col: usize },
    #[error("unexpected `]` at line {line}, column {col}")]
    StrayArrayEnd { line: usize, col: usize },
    #[error("parameter list name expected at line {line}, column {col}")]
    ExpectedParamName { line: usize, col: usize },
    #[error("unexpected end of stream inside request `{0}`")]
    TruncatedRequest(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
