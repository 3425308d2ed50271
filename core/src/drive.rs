use crate::CompactError;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Letters that are never handed out: floppy slots and the system drive.
pub const RESERVED_LETTERS: &str = "ABC";

pub const DEFAULT_CANDIDATE_LETTERS: &str = "DEFGHIJKLMNOPQRSTUVWXYZ";

/// Upper bound for any settle wait, also used when a deadline would overflow.
pub const MAX_SETTLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + timeout`, clamped instead of overflowing.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + MAX_SETTLE_TIMEOUT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriveLetter(char);

impl DriveLetter {
    pub fn new(letter: char) -> Result<Self, CompactError> {
        if letter.is_ascii_alphabetic() {
            Ok(Self(letter.to_ascii_uppercase()))
        } else {
            Err(CompactError::InvalidDriveLetter(letter))
        }
    }

    pub fn as_char(self) -> char {
        self.0
    }

    /// Volume root as the OS spells it, e.g. `D:\`.
    pub fn root(self) -> String {
        format!("{}:\\", self.0)
    }

    fn bit(self) -> u32 {
        1 << (self.0 as u32 - 'A' as u32)
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a pool such as `"DEFGH"` into letters, preserving order and
/// dropping duplicates.
pub fn parse_letters(pool: &str) -> Result<Vec<DriveLetter>, CompactError> {
    let mut letters: Vec<DriveLetter> = Vec::new();
    for c in pool.chars().filter(|c| !c.is_whitespace()) {
        let letter = DriveLetter::new(c)?;
        if !letters.contains(&letter) {
            letters.push(letter);
        }
    }
    Ok(letters)
}

/// Decode a logical-drive bitmask where bit 0 is `A:`.
pub fn letters_from_mask(mask: u32) -> BTreeSet<DriveLetter> {
    ('A'..='Z')
        .map(DriveLetter)
        .filter(|letter| mask & letter.bit() != 0)
        .collect()
}

/// Read-only view of the host's mounted volumes.
#[async_trait::async_trait]
pub trait VolumeTable: Send + Sync {
    async fn mounted_letters(&self) -> Result<BTreeSet<DriveLetter>, CompactError>;
}

pub struct DriveLetterAllocator<'a> {
    volumes: &'a dyn VolumeTable,
    pool: Vec<DriveLetter>,
}

impl<'a> DriveLetterAllocator<'a> {
    pub fn new(volumes: &'a dyn VolumeTable, pool: Vec<DriveLetter>) -> Self {
        Self { volumes, pool }
    }

    pub fn with_default_pool(volumes: &'a dyn VolumeTable) -> Self {
        let pool = DEFAULT_CANDIDATE_LETTERS.chars().map(DriveLetter).collect();
        Self::new(volumes, pool)
    }

    pub fn pool(&self) -> &[DriveLetter] {
        &self.pool
    }

    /// First letter of the pool that no mounted volume currently claims.
    pub async fn allocate_free_letter(&self) -> Result<DriveLetter, CompactError> {
        let mounted = self.volumes.mounted_letters().await?;
        tracing::debug!("Mounted volumes: {:?}", mounted);

        self.pool
            .iter()
            .copied()
            .find(|letter| !mounted.contains(letter))
            .ok_or(CompactError::NoFreeDriveLetter)
    }

    pub async fn letter_in_use(&self, letter: DriveLetter) -> Result<bool, CompactError> {
        Ok(self.volumes.mounted_letters().await?.contains(&letter))
    }

    /// Poll until `letter` shows up or `timeout` elapses. Always checks at
    /// least once.
    pub async fn wait_for_letter(
        &self,
        letter: DriveLetter,
        timeout: Duration,
        interval: Duration,
    ) -> Result<bool, CompactError> {
        let deadline = deadline_after(timeout);
        loop {
            if self.letter_in_use(letter).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tracing::trace!("{}: not mounted yet, retrying in {:?}", letter, interval);
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockVolumeTable;

    fn letters(s: &str) -> Vec<DriveLetter> {
        parse_letters(s).unwrap()
    }

    #[test]
    fn drive_letter_normalizes_case() {
        let letter = DriveLetter::new('e').unwrap();
        assert_eq!(letter.as_char(), 'E');
        assert_eq!(letter.root(), "E:\\");
        assert_eq!(letter.to_string(), "E");
    }

    #[test]
    fn drive_letter_rejects_non_letters() {
        assert!(matches!(DriveLetter::new('1'), Err(CompactError::InvalidDriveLetter('1'))));
        assert!(DriveLetter::new('é').is_err());
    }

    #[test]
    fn parse_letters_keeps_order_and_drops_duplicates() {
        let parsed = letters("f e F g");
        let chars: String = parsed.iter().map(|l| l.as_char()).collect();
        assert_eq!(chars, "FEG");
    }

    #[test]
    fn mask_decoding() {
        // A, C and Z
        let mask = 0b1 | 0b100 | (1 << 25);
        let decoded: String = letters_from_mask(mask).iter().map(|l| l.as_char()).collect();
        assert_eq!(decoded, "ACZ");
        assert!(letters_from_mask(0).is_empty());
    }

    #[test]
    fn default_pool_excludes_reserved_letters() {
        let pool = letters(DEFAULT_CANDIDATE_LETTERS);
        for reserved in RESERVED_LETTERS.chars() {
            assert!(!pool.contains(&DriveLetter::new(reserved).unwrap()));
        }
        assert_eq!(pool.len(), 23);
    }

    #[tokio::test]
    async fn allocates_letter_outside_mounted_set() {
        let volumes = MockVolumeTable::with_letters("CDEG");
        let allocator = DriveLetterAllocator::with_default_pool(&volumes);

        let letter = allocator.allocate_free_letter().await.unwrap();
        assert_eq!(letter.as_char(), 'F');
        assert!(!volumes.is_mounted(letter));
    }

    #[tokio::test]
    async fn every_partially_consumed_pool_yields_a_pool_member() {
        let pool = letters("DEFG");
        for mask in 0u32..16 {
            let mounted: String = pool
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, l)| l.as_char())
                .collect();
            let volumes = MockVolumeTable::with_letters(&format!("C{}", mounted));
            let allocator = DriveLetterAllocator::new(&volumes, pool.clone());

            match allocator.allocate_free_letter().await {
                Ok(letter) => {
                    assert!(pool.contains(&letter));
                    assert!(!mounted.contains(letter.as_char()));
                }
                Err(CompactError::NoFreeDriveLetter) => assert_eq!(mask, 0b1111),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn exhausted_pool_fails() {
        let volumes = MockVolumeTable::with_letters("ABCDEFGHIJKLMNOPQRSTUVWXYZ");
        let allocator = DriveLetterAllocator::with_default_pool(&volumes);

        let result = allocator.allocate_free_letter().await;
        assert!(matches!(result, Err(CompactError::NoFreeDriveLetter)));
    }

    #[tokio::test]
    async fn letter_in_use_tracks_mounts() {
        let volumes = MockVolumeTable::with_letters("C");
        let allocator = DriveLetterAllocator::with_default_pool(&volumes);
        let x = DriveLetter::new('X').unwrap();

        assert!(!allocator.letter_in_use(x).await.unwrap());
        volumes.mount(x);
        assert!(allocator.letter_in_use(x).await.unwrap());
        volumes.unmount(x);
        assert!(!allocator.letter_in_use(x).await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_letter_gives_up_after_timeout() {
        let volumes = MockVolumeTable::with_letters("C");
        let allocator = DriveLetterAllocator::with_default_pool(&volumes);
        let x = DriveLetter::new('X').unwrap();

        let appeared = allocator
            .wait_for_letter(x, Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap();
        assert!(!appeared);
        assert!(volumes.query_count() >= 2);
    }

    #[test]
    fn default_allocator_pool_matches_candidate_letters() {
        let volumes = MockVolumeTable::with_letters("C");
        let allocator = DriveLetterAllocator::with_default_pool(&volumes);
        assert_eq!(allocator.pool(), letters(DEFAULT_CANDIDATE_LETTERS).as_slice());
    }

    #[tokio::test]
    async fn huge_timeout_does_not_overflow_deadline() {
        let volumes = MockVolumeTable::with_letters("CX");
        let allocator = DriveLetterAllocator::with_default_pool(&volumes);
        let x = DriveLetter::new('X').unwrap();

        let appeared = allocator
            .wait_for_letter(x, Duration::MAX, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(appeared);
        assert!(deadline_after(Duration::MAX) > Instant::now());
    }

    #[tokio::test]
    async fn wait_for_letter_returns_once_mounted() {
        let volumes = MockVolumeTable::with_letters("CX");
        let allocator = DriveLetterAllocator::with_default_pool(&volumes);
        let x = DriveLetter::new('X').unwrap();

        let appeared = allocator
            .wait_for_letter(x, Duration::ZERO, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(appeared);
        assert_eq!(volumes.query_count(), 1);
    }
}
