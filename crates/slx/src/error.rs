use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognized token at byte {0} of shader source")]
    Lex(usize),
    #[error("unexpected end of shader source")]
    UnexpectedEof,
    #[error("unknown shader type `{0}`")]
    UnknownShaderType(SmolStr),
    #[error("unknown opcode `{0}`")]
    UnknownOpcode(SmolStr),
    #[error("unknown variable `{0}`")]
    UnknownVariable(SmolStr),
    #[error("undefined label `{0}`")]
    UndefinedLabel(SmolStr),
    #[error("malformed declaration: {0}")]
    MalformedDeclaration(String),
    #[error("expected {expected}, found `{found}`")]
    UnexpectedToken { expected: &'static str, found: String },
    #[error("external shadeop calls are not supported (`{0}`)")]
    ExternalCall(SmolStr),
    #[error("operand stack underflow in `{0}`")]
    StackUnderflow(&'static str),
    #[error("shader `{0}` has no program")]
    EmptyProgram(SmolStr),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
