//! In-memory repository doubles for exercising the agent without SQLite.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rust_decimal::Decimal;

use tunesmith_core::{
    Conversation, ConversationId, Identity, Message, Role, RoutingState, Suspension,
};

use super::{
    AlbumSummary, AlbumTrack, ArtistRecommendation, BillingInfo, CatalogRepository,
    ConversationRecord, ConversationRepository, EmployeeProfile, GenreCount, InvoiceHeader,
    InvoiceItem, InvoiceRepository, InvoiceSummary, NewInvoice, PopularTrack, PurchaseLine,
    RecommendationRepository, RepositoryError, SubjectRepository, SupportedCustomer, TrackDetail,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- Subjects ---------------------------------------------------------------

#[derive(Default)]
pub struct InMemorySubjectRepository {
    identities: Mutex<Vec<Identity>>,
    billing: Mutex<HashMap<i64, BillingInfo>>,
}

impl InMemorySubjectRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: Identity) {
        lock(&self.identities).push(identity);
    }

    pub fn insert_billing(&self, customer_id: i64, billing: BillingInfo) {
        lock(&self.billing).insert(customer_id, billing);
    }
}

#[async_trait::async_trait]
impl SubjectRepository for InMemorySubjectRepository {
    async fn find_identity_by_credential(
        &self,
        credential: &str,
    ) -> Result<Option<Identity>, RepositoryError> {
        let normalized = credential.trim().to_ascii_lowercase();
        let identities = lock(&self.identities);
        let first_name = |identity: &Identity| {
            identity.name.split_whitespace().next().unwrap_or_default().to_ascii_lowercase()
        };

        let employee = identities
            .iter()
            .find(|identity| identity.role == Role::Employee && first_name(identity) == normalized);
        let customer = identities
            .iter()
            .find(|identity| identity.role == Role::Customer && first_name(identity) == normalized);

        Ok(employee.or(customer).cloned())
    }

    async fn find_identity_by_subject(
        &self,
        role: Role,
        subject_id: i64,
    ) -> Result<Option<Identity>, RepositoryError> {
        Ok(lock(&self.identities)
            .iter()
            .find(|identity| identity.role == role && identity.subject_id == subject_id)
            .cloned())
    }

    async fn employee_profile(
        &self,
        _employee_id: i64,
    ) -> Result<Option<EmployeeProfile>, RepositoryError> {
        Ok(None)
    }

    async fn supported_customers(
        &self,
        employee_id: i64,
    ) -> Result<Vec<SupportedCustomer>, RepositoryError> {
        let identities = lock(&self.identities);
        let Some(employee) = identities
            .iter()
            .find(|identity| identity.role == Role::Employee && identity.subject_id == employee_id)
        else {
            return Ok(Vec::new());
        };

        Ok(identities
            .iter()
            .filter(|identity| {
                identity.role == Role::Customer && employee.scope.contains(&identity.subject_id)
            })
            .map(|identity| {
                let mut parts = identity.name.split_whitespace();
                SupportedCustomer {
                    customer_id: identity.subject_id,
                    first_name: parts.next().unwrap_or_default().to_string(),
                    last_name: parts.next().unwrap_or_default().to_string(),
                    email: None,
                    city: None,
                    country: None,
                    invoice_count: 0,
                    total_spent: Decimal::ZERO,
                }
            })
            .collect())
    }

    async fn customer_billing(
        &self,
        customer_id: i64,
    ) -> Result<Option<BillingInfo>, RepositoryError> {
        Ok(lock(&self.billing).get(&customer_id).cloned())
    }
}

// --- Catalog ----------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCatalogRepository {
    tracks: Mutex<Vec<TrackDetail>>,
    albums: Mutex<Vec<(AlbumSummary, Vec<AlbumTrack>)>>,
}

impl InMemoryCatalogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_track(&self, track: TrackDetail) {
        lock(&self.tracks).push(track);
    }

    pub fn insert_album(&self, album: AlbumSummary, tracks: Vec<AlbumTrack>) {
        lock(&self.albums).push((album, tracks));
    }
}

#[async_trait::async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    async fn find_track(&self, track_id: i64) -> Result<Option<TrackDetail>, RepositoryError> {
        Ok(lock(&self.tracks).iter().find(|track| track.track_id == track_id).cloned())
    }

    async fn search_tracks(&self, query: &str) -> Result<Vec<TrackDetail>, RepositoryError> {
        let needle = query.trim().to_ascii_lowercase();
        Ok(lock(&self.tracks)
            .iter()
            .filter(|track| {
                track.name.to_ascii_lowercase().contains(&needle)
                    || track.artist.to_ascii_lowercase().contains(&needle)
                    || track.album.to_ascii_lowercase().contains(&needle)
            })
            .take(20)
            .cloned()
            .collect())
    }

    async fn search_albums(&self, query: &str) -> Result<Vec<AlbumSummary>, RepositoryError> {
        let needle = query.trim().to_ascii_lowercase();
        Ok(lock(&self.albums)
            .iter()
            .filter(|(album, _)| {
                album.title.to_ascii_lowercase().contains(&needle)
                    || album.artist.to_ascii_lowercase().contains(&needle)
            })
            .take(15)
            .map(|(album, _)| album.clone())
            .collect())
    }

    async fn find_album(&self, album_id: i64) -> Result<Option<AlbumSummary>, RepositoryError> {
        Ok(lock(&self.albums)
            .iter()
            .find(|(album, _)| album.album_id == album_id)
            .map(|(album, _)| album.clone()))
    }

    async fn album_tracks(&self, album_id: i64) -> Result<Vec<AlbumTrack>, RepositoryError> {
        Ok(lock(&self.albums)
            .iter()
            .find(|(album, _)| album.album_id == album_id)
            .map(|(_, tracks)| tracks.clone())
            .unwrap_or_default())
    }
}

// --- Invoices ---------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryInvoiceRepository {
    next_id: Mutex<i64>,
    invoices: Mutex<Vec<(InvoiceHeader, Vec<InvoiceItem>)>>,
}

impl InMemoryInvoiceRepository {
    pub fn new() -> Self {
        Self { next_id: Mutex::new(1), invoices: Mutex::new(Vec::new()) }
    }

    pub fn invoice_count(&self) -> usize {
        lock(&self.invoices).len()
    }

    pub fn insert(&self, header: InvoiceHeader, items: Vec<InvoiceItem>) {
        let mut next_id = lock(&self.next_id);
        *next_id = (*next_id).max(header.invoice_id + 1);
        lock(&self.invoices).push((header, items));
    }
}

#[async_trait::async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn invoices_for_customer(
        &self,
        customer_id: i64,
    ) -> Result<Vec<InvoiceSummary>, RepositoryError> {
        Ok(lock(&self.invoices)
            .iter()
            .filter(|(header, _)| header.customer_id == customer_id)
            .map(|(header, _)| InvoiceSummary {
                invoice_id: header.invoice_id,
                invoice_date: header.invoice_date,
                billing_city: header.billing_city.clone(),
                billing_country: header.billing_country.clone(),
                total: header.total,
            })
            .collect())
    }

    async fn purchases_for_customer(
        &self,
        customer_id: i64,
    ) -> Result<Vec<PurchaseLine>, RepositoryError> {
        Ok(lock(&self.invoices)
            .iter()
            .filter(|(header, _)| header.customer_id == customer_id)
            .flat_map(|(header, items)| {
                items
                    .iter()
                    .map(|item| PurchaseLine {
                        track: item.track.clone(),
                        artist: item.artist.clone(),
                        album: String::new(),
                        genre: None,
                        price: item.unit_price,
                        purchased_at: header.invoice_date,
                    })
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, RepositoryError> {
        Ok(lock(&self.invoices)
            .iter()
            .find(|(header, _)| header.invoice_id == invoice_id)
            .map(|(header, _)| header.clone()))
    }

    async fn invoice_items(&self, invoice_id: i64) -> Result<Vec<InvoiceItem>, RepositoryError> {
        Ok(lock(&self.invoices)
            .iter()
            .find(|(header, _)| header.invoice_id == invoice_id)
            .map(|(_, items)| items.clone())
            .unwrap_or_default())
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> Result<i64, RepositoryError> {
        let invoice_id = {
            let mut next_id = lock(&self.next_id);
            let id = *next_id;
            *next_id += 1;
            id
        };

        let items = invoice
            .lines
            .iter()
            .map(|line| InvoiceItem {
                track: format!("track {}", line.track_id),
                artist: String::new(),
                unit_price: line.unit_price,
                quantity: line.quantity,
            })
            .collect();

        lock(&self.invoices).push((
            InvoiceHeader {
                invoice_id,
                customer_id: invoice.customer_id,
                customer_name: String::new(),
                invoice_date: chrono::Utc::now(),
                billing_address: invoice.billing.address,
                billing_city: invoice.billing.city,
                billing_country: invoice.billing.country,
                total: invoice.total,
            },
            items,
        ));

        Ok(invoice_id)
    }

    async fn update_total(
        &self,
        invoice_id: i64,
        new_total: Decimal,
    ) -> Result<bool, RepositoryError> {
        let mut invoices = lock(&self.invoices);
        match invoices.iter_mut().find(|(header, _)| header.invoice_id == invoice_id) {
            Some((header, _)) => {
                header.total = new_total;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_invoice(&self, invoice_id: i64) -> Result<bool, RepositoryError> {
        let mut invoices = lock(&self.invoices);
        let before = invoices.len();
        invoices.retain(|(header, _)| header.invoice_id != invoice_id);
        Ok(invoices.len() < before)
    }
}

// --- Recommendations --------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRecommendationRepository {
    genres: Mutex<HashMap<i64, Vec<GenreCount>>>,
    suggestions: Mutex<Vec<TrackDetail>>,
}

impl InMemoryRecommendationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_genres(&self, customer_id: i64, genres: Vec<GenreCount>) {
        lock(&self.genres).insert(customer_id, genres);
    }

    pub fn insert_suggestion(&self, track: TrackDetail) {
        lock(&self.suggestions).push(track);
    }
}

#[async_trait::async_trait]
impl RecommendationRepository for InMemoryRecommendationRepository {
    async fn top_genres(&self, customer_id: i64) -> Result<Vec<GenreCount>, RepositoryError> {
        Ok(lock(&self.genres).get(&customer_id).cloned().unwrap_or_default())
    }

    async fn unowned_tracks_in_genres(
        &self,
        genre_ids: &[i64],
        _customer_id: i64,
        limit: i64,
    ) -> Result<Vec<TrackDetail>, RepositoryError> {
        if genre_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(lock(&self.suggestions).iter().take(limit as usize).cloned().collect())
    }

    async fn unheard_artists(
        &self,
        _customer_id: i64,
        limit: i64,
    ) -> Result<Vec<ArtistRecommendation>, RepositoryError> {
        Ok(lock(&self.suggestions)
            .iter()
            .take(limit as usize)
            .map(|track| ArtistRecommendation {
                artist: track.artist.clone(),
                track_count: 1,
                genres: track.genre.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn popular_in_genre(
        &self,
        genre_name: &str,
        _exclude_customer: Option<i64>,
        limit: i64,
    ) -> Result<Vec<PopularTrack>, RepositoryError> {
        let needle = genre_name.trim().to_ascii_lowercase();
        Ok(lock(&self.suggestions)
            .iter()
            .filter(|track| {
                track
                    .genre
                    .as_deref()
                    .is_some_and(|genre| genre.to_ascii_lowercase() == needle)
            })
            .take(limit as usize)
            .map(|track| PopularTrack {
                track: track.name.clone(),
                artist: track.artist.clone(),
                unit_price: track.unit_price,
                times_sold: 1,
            })
            .collect())
    }
}

// --- Conversations ----------------------------------------------------------

#[derive(Default)]
pub struct InMemoryConversationRepository {
    records: Mutex<HashMap<ConversationId, ConversationRecord>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, RepositoryError> {
        Ok(lock(&self.records).get(id).cloned())
    }

    async fn create(
        &self,
        id: &ConversationId,
        role: Role,
        subject_id: i64,
    ) -> Result<(), RepositoryError> {
        lock(&self.records).insert(
            id.clone(),
            ConversationRecord {
                conversation: Conversation::new(id.clone()),
                routing: RoutingState::default(),
                subject_role: role,
                subject_id,
            },
        );
        Ok(())
    }

    async fn append_messages(
        &self,
        id: &ConversationId,
        from_seq: i64,
        messages: &[Message],
    ) -> Result<(), RepositoryError> {
        let mut records = lock(&self.records);
        if let Some(record) = records.get_mut(id) {
            debug_assert_eq!(record.conversation.messages().len() as i64, from_seq);
            for message in messages {
                record.conversation.push(message.clone());
            }
        }
        Ok(())
    }

    async fn set_turn_count(
        &self,
        id: &ConversationId,
        turn_count: i64,
    ) -> Result<(), RepositoryError> {
        if let Some(record) = lock(&self.records).get_mut(id) {
            record.routing.turn_count = turn_count;
        }
        Ok(())
    }

    async fn install_suspension(
        &self,
        id: &ConversationId,
        suspension: &Suspension,
    ) -> Result<(), RepositoryError> {
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(id) else {
            return Ok(());
        };
        if record.routing.pending_suspension.is_some() {
            return Err(RepositoryError::SuspensionOccupied(id.0.clone()));
        }
        record.routing.pending_suspension = Some(suspension.clone());
        Ok(())
    }

    async fn clear_suspension(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Suspension>, RepositoryError> {
        Ok(lock(&self.records)
            .get_mut(id)
            .and_then(|record| record.routing.pending_suspension.take()))
    }
}

#[cfg(test)]
mod tests {
    use tunesmith_core::{ConversationId, HandlerName, Role, Suspension, SuspensionKind};

    use super::InMemoryConversationRepository;
    use crate::repositories::{ConversationRepository, RepositoryError};

    fn suspension() -> Suspension {
        Suspension {
            kind: SuspensionKind::Approval,
            handler: HandlerName::InvoiceDesk,
            action: "delete_invoice".to_string(),
            args: serde_json::Map::new(),
            prompt: "Approve deletion of invoice 5?".to_string(),
        }
    }

    #[tokio::test]
    async fn double_honors_the_single_pending_invariant() {
        let repo = InMemoryConversationRepository::new();
        let id = ConversationId("c-1".to_string());
        repo.create(&id, Role::Employee, 3).await.expect("create");

        repo.install_suspension(&id, &suspension()).await.expect("install");
        let err =
            repo.install_suspension(&id, &suspension()).await.expect_err("second must fail");
        assert!(matches!(err, RepositoryError::SuspensionOccupied(_)));

        assert!(repo.clear_suspension(&id).await.expect("clear").is_some());
        assert!(repo.clear_suspension(&id).await.expect("clear").is_none());
    }
}
