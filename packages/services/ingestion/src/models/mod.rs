pub mod candidate;
pub mod status;

pub use candidate::*;
pub use status::*;

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("BSON encoding error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("BSON decoding error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("AI provider error: {0}")]
    Ai(String),

    #[error("Status tracker error: {0}")]
    Tracker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<csv::Error> for IngestionError {
    fn from(e: csv::Error) -> Self {
        IngestionError::Parse(format!("CSV: {}", e))
    }
}

impl From<quick_xml::Error> for IngestionError {
    fn from(e: quick_xml::Error) -> Self {
        IngestionError::Parse(format!("XML: {}", e))
    }
}

impl From<zip::result::ZipError> for IngestionError {
    fn from(e: zip::result::ZipError) -> Self {
        IngestionError::Parse(format!("workbook container: {}", e))
    }
}

impl IngestionError {
    /// Renders the `source()` chain below the top-level message, one cause per line.
    pub fn source_chain(&self) -> Option<String> {
        let mut causes = Vec::new();
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            causes.push(format!("caused by: {}", err));
            current = err.source();
        }
        if causes.is_empty() { None } else { Some(causes.join("\n")) }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;
