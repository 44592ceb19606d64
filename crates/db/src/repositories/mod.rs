use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use tunesmith_core::{Conversation, ConversationId, Identity, Message, Role, RoutingState, Suspension};

pub mod catalog;
pub mod conversation;
pub mod invoice;
pub mod memory;
pub mod recommendation;
pub mod subject;

pub use catalog::SqlCatalogRepository;
pub use conversation::SqlConversationRepository;
pub use invoice::SqlInvoiceRepository;
pub use memory::{
    InMemoryCatalogRepository, InMemoryConversationRepository, InMemoryInvoiceRepository,
    InMemoryRecommendationRepository, InMemorySubjectRepository,
};
pub use recommendation::SqlRecommendationRepository;
pub use subject::SqlSubjectRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("a suspension is already installed for conversation {0}")]
    SuspensionOccupied(String),
}

impl From<RepositoryError> for tunesmith_core::AgentError {
    fn from(value: RepositoryError) -> Self {
        tunesmith_core::AgentError::Storage(value.to_string())
    }
}

// --- Subject store rows ---------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmployeeProfile {
    pub employee_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub title: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub hire_date: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub manager_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SupportedCustomer {
    pub customer_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub invoice_count: i64,
    pub total_spent: Decimal,
}

/// Billing snapshot copied onto an invoice at purchase time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BillingInfo {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

/// Raw lookups against the subject store. Identity policy (generic
/// unauthorized failures, per-request resolution) lives above this trait.
#[async_trait]
pub trait SubjectRepository: Send + Sync {
    /// Credential-to-identity lookup. Employee matches win over customer
    /// matches; both lookups run unconditionally.
    async fn find_identity_by_credential(
        &self,
        credential: &str,
    ) -> Result<Option<Identity>, RepositoryError>;

    async fn find_identity_by_subject(
        &self,
        role: Role,
        subject_id: i64,
    ) -> Result<Option<Identity>, RepositoryError>;

    async fn employee_profile(
        &self,
        employee_id: i64,
    ) -> Result<Option<EmployeeProfile>, RepositoryError>;

    async fn supported_customers(
        &self,
        employee_id: i64,
    ) -> Result<Vec<SupportedCustomer>, RepositoryError>;

    async fn customer_billing(
        &self,
        customer_id: i64,
    ) -> Result<Option<BillingInfo>, RepositoryError>;
}

// --- Catalog rows ---------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct TrackDetail {
    pub track_id: i64,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub genre: Option<String>,
    pub unit_price: Decimal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlbumSummary {
    pub album_id: i64,
    pub title: String,
    pub artist: String,
    pub track_count: i64,
    pub total_price: Decimal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlbumTrack {
    pub track_id: i64,
    pub name: String,
    pub unit_price: Decimal,
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn find_track(&self, track_id: i64) -> Result<Option<TrackDetail>, RepositoryError>;

    /// LIKE search over track, artist, and album names. Capped at 20 rows.
    async fn search_tracks(&self, query: &str) -> Result<Vec<TrackDetail>, RepositoryError>;

    /// LIKE search over album titles and artist names. Capped at 15 rows.
    async fn search_albums(&self, query: &str) -> Result<Vec<AlbumSummary>, RepositoryError>;

    async fn find_album(&self, album_id: i64) -> Result<Option<AlbumSummary>, RepositoryError>;

    async fn album_tracks(&self, album_id: i64) -> Result<Vec<AlbumTrack>, RepositoryError>;
}

// --- Invoice rows ---------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct InvoiceSummary {
    pub invoice_id: i64,
    pub invoice_date: DateTime<Utc>,
    pub billing_city: Option<String>,
    pub billing_country: Option<String>,
    pub total: Decimal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvoiceHeader {
    pub invoice_id: i64,
    pub customer_id: i64,
    pub customer_name: String,
    pub invoice_date: DateTime<Utc>,
    pub billing_address: Option<String>,
    pub billing_city: Option<String>,
    pub billing_country: Option<String>,
    pub total: Decimal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvoiceItem {
    pub track: String,
    pub artist: String,
    pub unit_price: Decimal,
    pub quantity: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PurchaseLine {
    pub track: String,
    pub artist: String,
    pub album: String,
    pub genre: Option<String>,
    pub price: Decimal,
    pub purchased_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewInvoiceLine {
    pub track_id: i64,
    pub unit_price: Decimal,
    pub quantity: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewInvoice {
    pub customer_id: i64,
    pub billing: BillingInfo,
    pub total: Decimal,
    pub lines: Vec<NewInvoiceLine>,
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn invoices_for_customer(
        &self,
        customer_id: i64,
    ) -> Result<Vec<InvoiceSummary>, RepositoryError>;

    async fn purchases_for_customer(
        &self,
        customer_id: i64,
    ) -> Result<Vec<PurchaseLine>, RepositoryError>;

    async fn invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, RepositoryError>;

    async fn invoice_items(&self, invoice_id: i64) -> Result<Vec<InvoiceItem>, RepositoryError>;

    /// Writes the invoice and all of its lines in one transaction; either
    /// the whole group commits or nothing does. Returns the new invoice id.
    async fn create_invoice(&self, invoice: NewInvoice) -> Result<i64, RepositoryError>;

    /// Returns false when the invoice does not exist.
    async fn update_total(
        &self,
        invoice_id: i64,
        new_total: Decimal,
    ) -> Result<bool, RepositoryError>;

    /// Deletes the invoice and its lines in one transaction. Returns false
    /// when the invoice does not exist.
    async fn delete_invoice(&self, invoice_id: i64) -> Result<bool, RepositoryError>;
}

// --- Recommendation rows --------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenreCount {
    pub genre_id: i64,
    pub name: String,
    pub purchase_count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtistRecommendation {
    pub artist: String,
    pub track_count: i64,
    pub genres: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PopularTrack {
    pub track: String,
    pub artist: String,
    pub unit_price: Decimal,
    pub times_sold: i64,
}

#[async_trait]
pub trait RecommendationRepository: Send + Sync {
    /// The customer's most-purchased genres, strongest first. Capped at 3.
    async fn top_genres(&self, customer_id: i64) -> Result<Vec<GenreCount>, RepositoryError>;

    /// Tracks from the given genres the customer does not already own.
    async fn unowned_tracks_in_genres(
        &self,
        genre_ids: &[i64],
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<TrackDetail>, RepositoryError>;

    /// Artists in the customer's purchased genres they have never bought.
    async fn unheard_artists(
        &self,
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<ArtistRecommendation>, RepositoryError>;

    /// Best-selling tracks in a genre, optionally excluding tracks a
    /// customer already owns.
    async fn popular_in_genre(
        &self,
        genre_name: &str,
        exclude_customer: Option<i64>,
        limit: i64,
    ) -> Result<Vec<PopularTrack>, RepositoryError>;
}

// --- Conversation persistence ---------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct ConversationRecord {
    pub conversation: Conversation,
    pub routing: RoutingState,
    pub subject_role: Role,
    pub subject_id: i64,
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, RepositoryError>;

    async fn create(
        &self,
        id: &ConversationId,
        role: Role,
        subject_id: i64,
    ) -> Result<(), RepositoryError>;

    /// Appends messages starting at sequence number `from_seq`.
    async fn append_messages(
        &self,
        id: &ConversationId,
        from_seq: i64,
        messages: &[Message],
    ) -> Result<(), RepositoryError>;

    async fn set_turn_count(
        &self,
        id: &ConversationId,
        turn_count: i64,
    ) -> Result<(), RepositoryError>;

    /// Installs the suspension; fails with [`RepositoryError::SuspensionOccupied`]
    /// when one is already pending for the conversation.
    async fn install_suspension(
        &self,
        id: &ConversationId,
        suspension: &Suspension,
    ) -> Result<(), RepositoryError>;

    /// Removes and returns the pending suspension, if any. This is the
    /// exactly-once gate: a redelivered resolution observes `None` here and
    /// must not re-apply the mutation.
    async fn clear_suspension(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Suspension>, RepositoryError>;
}
