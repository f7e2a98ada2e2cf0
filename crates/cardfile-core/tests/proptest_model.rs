//! Property-based tests for contact records and field validation.
//!
//! Tests cover: draft validation, phone normalization, patch application,
//! roster add/get-all equivalence, and serde roundtrips of records.

use proptest::prelude::*;

use cardfile_core::model::{
    Contact, ContactDraft, ContactPatch, NAME_MAX_CHARS, PHONE_MAX_DIGITS, PHONE_MIN_DIGITS,
    normalize_phone,
};
use cardfile_core::roster::Roster;

const NOW: i64 = 1_700_000_000_000;

// ============================================================================
// Strategies
// ============================================================================

fn arb_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z .'-]{0,60}".prop_map(|s| s.trim().to_string()).prop_filter(
        "non-empty after trim",
        |s| !s.is_empty() && s.chars().count() <= NAME_MAX_CHARS,
    )
}

fn arb_email() -> impl Strategy<Value = String> {
    "[a-z0-9._]{1,12}@[a-z0-9]{1,10}\\.[a-z]{2,4}"
}

fn arb_phone_digits() -> impl Strategy<Value = String> {
    proptest::collection::vec(0..10u8, PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS)
        .prop_map(|digits| digits.into_iter().map(|d| char::from(b'0' + d)).collect())
}

fn arb_valid_draft() -> impl Strategy<Value = ContactDraft> {
    (
        arb_name(),
        proptest::option::of(arb_email()),
        proptest::option::of(arb_phone_digits()),
    )
        .prop_map(|(name, email, phone)| ContactDraft { name, email, phone })
}

// ============================================================================
// Validation
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Any valid draft produces a record carrying the draft's fields.
    #[test]
    fn prop_valid_draft_creates_record(draft in arb_valid_draft()) {
        let contact = Contact::create(draft.clone(), NOW).unwrap();
        prop_assert_eq!(contact.name, draft.name);
        prop_assert_eq!(contact.email, draft.email);
        prop_assert_eq!(contact.phone, draft.phone);
        prop_assert_eq!(contact.created_at_ms, NOW);
        prop_assert_eq!(contact.updated_at_ms, NOW);
        prop_assert!(!contact.favorite);
        prop_assert!(!contact.blocked);
        prop_assert!(contact.groups.is_empty());
    }

    /// Ids never collide across creations.
    #[test]
    fn prop_ids_are_unique(draft in arb_valid_draft()) {
        let a = Contact::create(draft.clone(), NOW).unwrap();
        let b = Contact::create(draft, NOW).unwrap();
        prop_assert_ne!(a.id, b.id);
    }

    /// Whitespace-padded names come back trimmed.
    #[test]
    fn prop_names_are_trimmed(name in arb_name(), pad in 0..4usize) {
        let padded = format!("{}{}{}", " ".repeat(pad), name, " ".repeat(pad));
        let contact = Contact::create(ContactDraft::new(padded), NOW).unwrap();
        prop_assert_eq!(contact.name, name);
    }
}

// ============================================================================
// Phone normalization
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Separators never change the digits that come out.
    #[test]
    fn prop_separators_are_stripped(
        digits in arb_phone_digits(),
        lead_plus in any::<bool>(),
    ) {
        // Interleave a separator after every third digit.
        let mut decorated = String::new();
        if lead_plus {
            decorated.push('+');
        }
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && i % 3 == 0 {
                decorated.push(['-', ' ', '.'][(i / 3) % 3]);
            }
            decorated.push(c);
        }
        let normalized = normalize_phone(&decorated);
        prop_assert_eq!(normalized.as_deref(), Some(digits.as_str()));
    }

    /// Normalization is idempotent: a normalized phone normalizes to itself.
    #[test]
    fn prop_normalization_is_idempotent(digits in arb_phone_digits()) {
        let once = normalize_phone(&digits).unwrap();
        let twice = normalize_phone(&once).unwrap();
        prop_assert_eq!(once, twice);
    }

    /// Digit counts outside the accepted band are rejected.
    #[test]
    fn prop_out_of_band_lengths_rejected(len in 1..30usize) {
        let phone = "7".repeat(len);
        let accepted = (PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&len);
        prop_assert_eq!(normalize_phone(&phone).is_some(), accepted);
    }
}

// ============================================================================
// Patch application
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A patch never changes the id or created_at, and updated_at never
    /// precedes created_at.
    #[test]
    fn prop_patch_preserves_identity(
        draft in arb_valid_draft(),
        new_name in arb_name(),
        delta_ms in -100_000..100_000i64,
    ) {
        let contact = Contact::create(draft, NOW).unwrap();
        let patched = contact.apply_patch(&ContactPatch::rename(new_name.clone()), NOW + delta_ms).unwrap();
        prop_assert_eq!(patched.id, contact.id);
        prop_assert_eq!(patched.created_at_ms, contact.created_at_ms);
        prop_assert_eq!(patched.name, new_name);
        prop_assert!(patched.updated_at_ms >= patched.created_at_ms);
    }

    /// An empty patch reproduces the record's content.
    #[test]
    fn prop_empty_patch_is_content_identity(draft in arb_valid_draft()) {
        let contact = Contact::create(draft, NOW).unwrap();
        let patched = contact.apply_patch(&ContactPatch::default(), NOW + 1).unwrap();
        prop_assert!(patched.same_content(&contact));
    }
}

// ============================================================================
// Roster round trips
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// add followed by get_all contains a record equal to the input modulo
    /// the assigned id and timestamps.
    #[test]
    fn prop_add_then_get_all_contains_input(drafts in proptest::collection::vec(arb_valid_draft(), 1..10)) {
        let mut roster = Roster::new();
        for draft in &drafts {
            roster.add(draft.clone(), NOW).unwrap();
        }
        let all = roster.get_all(None);
        prop_assert_eq!(all.len(), drafts.len());
        for draft in &drafts {
            prop_assert!(
                all.iter().any(|c| c.name == draft.name
                    && c.email == draft.email
                    && c.phone == draft.phone),
                "missing record for {:?}", draft.name
            );
        }
        // Sorted by name case-insensitively.
        for pair in all.windows(2) {
            prop_assert!(pair[0].name.to_lowercase() <= pair[1].name.to_lowercase());
        }
    }

    /// Records survive serde untouched.
    #[test]
    fn prop_contact_serde_roundtrip(draft in arb_valid_draft()) {
        let contact = Contact::create(draft, NOW).unwrap();
        let json = serde_json::to_string(&contact).unwrap();
        let decoded: Contact = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(decoded, contact);
    }
}
