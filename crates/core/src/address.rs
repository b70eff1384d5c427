use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Separator between the segments of a synthetic address and of a memo.
pub const DELIMITER: char = ':';

/// A chain account as known to the resolver: canonical id plus the
/// human-readable name registered on-chain (empty when the chain has none).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: String,
    pub name: String,
}

impl AccountRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Looks up a chain account by id or registered name.
///
/// Resolution is an external call in production; implementations decide how.
pub trait AccountResolver: Send + Sync {
    fn resolve(&self, id_or_name: &str) -> Result<AccountRef, CoreError>;
}

/// Memoizing decorator over another resolver. Successful lookups are kept
/// for the lifetime of the value; failures are not cached.
pub struct CachedResolver {
    inner: Arc<dyn AccountResolver>,
    cache: Mutex<HashMap<String, AccountRef>>,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn AccountResolver>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl AccountResolver for CachedResolver {
    fn resolve(&self, id_or_name: &str) -> Result<AccountRef, CoreError> {
        if let Ok(cache) = self.cache.lock()
            && let Some(hit) = cache.get(id_or_name)
        {
            return Ok(hit.clone());
        }
        let resolved = self.inner.resolve(id_or_name)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(id_or_name.to_string(), resolved.clone());
        }
        Ok(resolved)
    }
}

/// The fixed set of on-chain accounts the exchange controls. Membership
/// tests match canonical id or registered name.
#[derive(Clone, Debug, Default)]
pub struct PooledAccounts {
    accounts: Vec<AccountRef>,
}

impl PooledAccounts {
    pub fn new(accounts: Vec<AccountRef>) -> Self {
        Self { accounts }
    }

    pub fn contains(&self, id_or_name: &str) -> bool {
        self.get(id_or_name).is_some()
    }

    pub fn get(&self, id_or_name: &str) -> Option<&AccountRef> {
        self.accounts
            .iter()
            .find(|a| a.id == id_or_name || (!a.name.is_empty() && a.name == id_or_name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccountRef> {
        self.accounts.iter()
    }
}

/// Segments of a synthetic address.
///
/// From [`parse`] the account segment is exactly as written; from
/// [`AddressCodec::split`] it is the canonical account id.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AddressParts {
    pub account_id: String,
    pub customer_id: String,
    pub incident_id: Option<String>,
}

/// Decoded memo payload.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MemoParts {
    pub customer_id: String,
    pub incident_id: Option<String>,
}

/// How a transfer relates to the pooled accounts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferKind {
    /// Both sides are pooled accounts (includes same-account transfers).
    Internal,
    /// Only the receiving side is pooled.
    Deposit,
    /// Only the sending side is pooled.
    Withdraw,
}

/// Splits a synthetic address into its segments without resolving anything.
///
/// `account:customer` and `account:customer:incident` are the accepted
/// shapes; the account segment must be non-empty, the customer segment may
/// be empty (external counterparty, no sub-account).
pub fn parse(address: &str) -> Result<AddressParts, CoreError> {
    let segments: Vec<&str> = address.split(DELIMITER).collect();
    let (account, customer, incident) = match segments.as_slice() {
        [account, customer] => (*account, *customer, None),
        [account, customer, incident] => (*account, *customer, Some(incident.to_string())),
        _ => return Err(CoreError::InvalidAddress(address.to_string())),
    };
    if account.is_empty() {
        return Err(CoreError::InvalidAddress(address.to_string()));
    }
    Ok(AddressParts {
        account_id: account.to_string(),
        customer_id: customer.to_string(),
        incident_id: incident,
    })
}

/// Generates a fresh opaque customer token.
pub fn random_customer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Encoder/decoder for synthetic addresses and on-chain memos.
///
/// Holds the pooled-account registry and an account resolver; everything
/// except resolution is pure string work.
pub struct AddressCodec {
    resolver: Arc<dyn AccountResolver>,
    pooled: PooledAccounts,
}

impl AddressCodec {
    pub fn new(resolver: Arc<dyn AccountResolver>, pooled: PooledAccounts) -> Self {
        Self { resolver, pooled }
    }

    pub fn pooled(&self) -> &PooledAccounts {
        &self.pooled
    }

    /// Splits an address and canonicalizes its account segment to the id.
    pub fn split(&self, address: &str) -> Result<AddressParts, CoreError> {
        let mut parts = parse(address)?;
        parts.account_id = self.resolver.resolve(&parts.account_id)?.id;
        Ok(parts)
    }

    /// Renders an address for `customer_id` under the given account.
    ///
    /// The account's registered name is preferred in the rendered text when
    /// the chain knows one; `split` maps either form back to the id.
    pub fn create(&self, account_id_or_name: &str, customer_id: &str) -> Result<String, CoreError> {
        let account = self.resolver.resolve(account_id_or_name)?;
        let shown = if account.name.is_empty() {
            &account.id
        } else {
            &account.name
        };
        Ok(format!("{shown}{DELIMITER}{customer_id}"))
    }

    /// As [`create`](Self::create), with the customer token produced by the
    /// supplied generator.
    pub fn create_with<F>(
        &self,
        account_id_or_name: &str,
        generator: F,
    ) -> Result<String, CoreError>
    where
        F: FnOnce() -> String,
    {
        let customer_id = generator();
        self.create(account_id_or_name, &customer_id)
    }

    /// As [`create`](Self::create), with a random customer token.
    pub fn create_unique(&self, account_id_or_name: &str) -> Result<String, CoreError> {
        self.create_with(account_id_or_name, random_customer_id)
    }

    /// True when the address parses and its account segment resolves.
    pub fn is_valid(&self, address: &str) -> bool {
        self.split(address).is_ok()
    }

    /// Classifies a transfer by which of its sides are pooled accounts.
    ///
    /// Either side may be given as a bare account id/name or as a full
    /// synthetic address; only the account segment is examined.
    pub fn classify(&self, from: &str, to: &str) -> Result<TransferKind, CoreError> {
        let from_pooled = self.pooled.contains(account_segment(from));
        let to_pooled = self.pooled.contains(account_segment(to));
        match (from_pooled, to_pooled) {
            (true, true) => Ok(TransferKind::Internal),
            (false, true) => Ok(TransferKind::Deposit),
            (true, false) => Ok(TransferKind::Withdraw),
            (false, false) => Err(CoreError::UnrelatedOperation {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// The single synthetic address whose balance a transfer affects.
    ///
    /// Pure in `(from, to, customer_id)`: no resolution happens, so the
    /// build path and the monitor path derive the same address for the same
    /// logical transfer.
    pub fn tracking_address(
        &self,
        from: &str,
        to: &str,
        customer_id: &str,
    ) -> Result<String, CoreError> {
        let side = match self.classify(from, to)? {
            TransferKind::Internal | TransferKind::Withdraw => from,
            TransferKind::Deposit => to,
        };
        Ok(format!("{}{DELIMITER}{customer_id}", account_segment(side)))
    }

    /// Synthetic address of the sending side of a stored operation.
    pub fn from_address(&self, from: &str, customer_id: &str) -> String {
        self.side_address(from, customer_id)
    }

    /// Synthetic address of the receiving side of a stored operation.
    pub fn to_address(&self, to: &str, customer_id: &str) -> String {
        self.side_address(to, customer_id)
    }

    fn side_address(&self, account: &str, customer_id: &str) -> String {
        let account = account_segment(account);
        if self.pooled.contains(account) {
            format!("{account}{DELIMITER}{customer_id}")
        } else {
            format!("{account}{DELIMITER}")
        }
    }

    /// Builds the plaintext memo for a transfer.
    ///
    /// The customer token comes from the sub-account side the transfer
    /// concerns. Withdrawals never embed the incident id: the memo travels
    /// to an external receiver and cannot be recovered on a return leg.
    pub fn create_memo(
        &self,
        from_addr: &str,
        to_addr: &str,
        incident_id: Option<&str>,
    ) -> Result<String, CoreError> {
        let kind = self.classify(from_addr, to_addr)?;
        let source = match kind {
            TransferKind::Internal | TransferKind::Withdraw => from_addr,
            TransferKind::Deposit => to_addr,
        };
        let customer_id = parse(source)?.customer_id;
        let memo = match incident_id {
            Some(incident) if kind != TransferKind::Withdraw => {
                format!("{customer_id}{DELIMITER}{incident}")
            }
            _ => customer_id,
        };
        Ok(memo)
    }

    /// Decodes a plaintext memo into customer and optional incident id.
    ///
    /// An empty memo is an error; text with more than one delimiter keeps
    /// the first segment as the customer id and drops the rest.
    pub fn split_memo(&self, text: &str) -> Result<MemoParts, CoreError> {
        if text.is_empty() {
            return Err(CoreError::EmptyMemo);
        }
        let segments: Vec<&str> = text.split(DELIMITER).collect();
        let incident_id = match segments.as_slice() {
            [_, incident] => Some(incident.to_string()),
            _ => None,
        };
        Ok(MemoParts {
            customer_id: segments[0].to_string(),
            incident_id,
        })
    }
}

fn account_segment(id_or_address: &str) -> &str {
    match id_or_address.find(DELIMITER) {
        Some(pos) => &id_or_address[..pos],
        None => id_or_address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticResolver {
        accounts: Vec<AccountRef>,
    }

    impl AccountResolver for StaticResolver {
        fn resolve(&self, id_or_name: &str) -> Result<AccountRef, CoreError> {
            self.accounts
                .iter()
                .find(|a| a.id == id_or_name || a.name == id_or_name)
                .cloned()
                .ok_or_else(|| CoreError::AccountResolution(id_or_name.to_string()))
        }
    }

    fn codec() -> AddressCodec {
        let directory = vec![
            AccountRef::new("1.2.100", "lykke"),
            AccountRef::new("1.2.101", "lykke-hot"),
            AccountRef::new("1.2.999", "someone"),
        ];
        let pooled = PooledAccounts::new(vec![
            AccountRef::new("1.2.100", "lykke"),
            AccountRef::new("1.2.101", "lykke-hot"),
        ]);
        AddressCodec::new(
            Arc::new(StaticResolver {
                accounts: directory,
            }),
            pooled,
        )
    }

    #[test]
    fn create_renders_name_and_split_recovers_id() {
        let codec = codec();
        let address = codec.create_with("1.2.100", || "abc".to_string()).unwrap();
        assert_eq!(address, "lykke:abc");

        let parts = codec.split("lykke:abc").unwrap();
        assert_eq!(parts.account_id, "1.2.100");
        assert_eq!(parts.customer_id, "abc");
        assert_eq!(parts.incident_id, None);
    }

    #[test]
    fn split_round_trips_every_segment_shape() {
        let codec = codec();
        for customer in ["", "abc", "c-9"] {
            let address = codec.create("lykke", customer).unwrap();
            let parts = codec.split(&address).unwrap();
            assert_eq!(parts.account_id, "1.2.100");
            assert_eq!(parts.customer_id, customer);
        }

        let parts = parse("lykke:abc:incident-7").unwrap();
        assert_eq!(parts.incident_id.as_deref(), Some("incident-7"));
    }

    #[test]
    fn parse_rejects_malformed_addresses() {
        assert!(parse("").is_err());
        assert!(parse("no-delimiter").is_err());
        assert!(parse(":customer").is_err());
        assert!(parse("a:b:c:d").is_err());
    }

    #[test]
    fn create_unique_generates_distinct_tokens() {
        let codec = codec();
        let a = codec.create_unique("lykke").unwrap();
        let b = codec.create_unique("lykke").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("lykke:"));
    }

    #[test]
    fn unknown_account_fails_resolution() {
        let codec = codec();
        let err = codec.split("nobody:abc").unwrap_err();
        assert!(matches!(err, CoreError::AccountResolution(_)));
        assert!(!codec.is_valid("nobody:abc"));
        assert!(codec.is_valid("someone:"));
    }

    #[test]
    fn classification_covers_all_relations() {
        let codec = codec();
        assert_eq!(
            codec.classify("1.2.100", "1.2.101").unwrap(),
            TransferKind::Internal
        );
        assert_eq!(
            codec.classify("1.2.100", "1.2.100").unwrap(),
            TransferKind::Internal
        );
        assert_eq!(
            codec.classify("1.2.999", "1.2.100").unwrap(),
            TransferKind::Deposit
        );
        assert_eq!(
            codec.classify("1.2.100", "1.2.999").unwrap(),
            TransferKind::Withdraw
        );
        assert!(matches!(
            codec.classify("1.2.999", "1.2.998"),
            Err(CoreError::UnrelatedOperation { .. })
        ));
    }

    #[test]
    fn classify_accepts_full_addresses() {
        let codec = codec();
        assert_eq!(
            codec.classify("lykke:abc", "1.2.999:").unwrap(),
            TransferKind::Withdraw
        );
    }

    #[test]
    fn tracking_address_follows_classification() {
        let codec = codec();
        // Deposit tracks the receiving sub-account.
        assert_eq!(
            codec.tracking_address("1.2.999", "1.2.100", "abc").unwrap(),
            "1.2.100:abc"
        );
        // Withdraw and internal track the sending sub-account.
        assert_eq!(
            codec.tracking_address("1.2.100", "1.2.999", "abc").unwrap(),
            "1.2.100:abc"
        );
        assert_eq!(
            codec.tracking_address("1.2.100", "1.2.101", "abc").unwrap(),
            "1.2.100:abc"
        );
    }

    #[test]
    fn side_addresses_mark_external_counterparties() {
        let codec = codec();
        assert_eq!(codec.from_address("1.2.100", "abc"), "1.2.100:abc");
        assert_eq!(codec.from_address("1.2.999", "abc"), "1.2.999:");
        assert_eq!(codec.to_address("1.2.101", "abc"), "1.2.101:abc");
        assert_eq!(codec.to_address("1.2.999", "abc"), "1.2.999:");
    }

    #[test]
    fn memo_round_trip_keeps_incident_for_deposit_and_internal() {
        let codec = codec();
        for (from, to) in [("1.2.999:", "lykke:abc"), ("lykke:abc", "lykke-hot:abc")] {
            let memo = codec.create_memo(from, to, Some("incident-1")).unwrap();
            let parts = codec.split_memo(&memo).unwrap();
            assert_eq!(parts.customer_id, "abc");
            assert_eq!(parts.incident_id.as_deref(), Some("incident-1"));
        }
    }

    #[test]
    fn withdraw_memo_never_carries_incident() {
        let codec = codec();
        let memo = codec
            .create_memo("lykke:abc", "1.2.999:", Some("incident-1"))
            .unwrap();
        assert_eq!(memo, "abc");
        let parts = codec.split_memo(&memo).unwrap();
        assert_eq!(parts.incident_id, None);
    }

    #[test]
    fn empty_memo_is_an_error() {
        let codec = codec();
        assert!(matches!(codec.split_memo(""), Err(CoreError::EmptyMemo)));
    }

    #[test]
    fn oversegmented_memo_keeps_customer_only() {
        let codec = codec();
        let parts = codec.split_memo("abc:inc:extra").unwrap();
        assert_eq!(parts.customer_id, "abc");
        assert_eq!(parts.incident_id, None);
    }

    #[test]
    fn cached_resolver_serves_repeat_lookups() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting {
            hits: AtomicUsize,
        }
        impl AccountResolver for Counting {
            fn resolve(&self, id_or_name: &str) -> Result<AccountRef, CoreError> {
                self.hits.fetch_add(1, Ordering::SeqCst);
                if id_or_name == "lykke" {
                    Ok(AccountRef::new("1.2.100", "lykke"))
                } else {
                    Err(CoreError::AccountResolution(id_or_name.to_string()))
                }
            }
        }

        let counting = Arc::new(Counting {
            hits: AtomicUsize::new(0),
        });
        let cached = CachedResolver::new(counting.clone());
        assert_eq!(cached.resolve("lykke").unwrap().id, "1.2.100");
        assert_eq!(cached.resolve("lykke").unwrap().id, "1.2.100");
        assert_eq!(counting.hits.load(Ordering::SeqCst), 1);

        // Failures are retried, not cached.
        assert!(cached.resolve("nobody").is_err());
        assert!(cached.resolve("nobody").is_err());
        assert_eq!(counting.hits.load(Ordering::SeqCst), 3);
    }
}
