//! Custom assertions for vault state
//!
//! Panicking helpers with messages that name the device and field that
//! diverged, so convergence failures are readable.

use std::fmt::Debug;

use crate::core_store::model::{CompanyId, EntityRef, KeyId};
use crate::vault::Vault;

/// Assert that a Result is Ok and return the value
pub fn assert_ok<T, E: Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that every vault shows the same values and heads for `entity`
pub fn assert_converged<V: AsRef<Vault>>(vaults: &[V], entity: &EntityRef) {
    let Some((first, rest)) = vaults.split_first() else {
        return;
    };
    let first = first.as_ref();
    let expected = assert_ok(first.get_entity(entity));
    for vault in rest {
        let vault = vault.as_ref();
        let actual = assert_ok(vault.get_entity(entity));
        assert_eq!(
            actual.deleted,
            expected.deleted,
            "{} and {} disagree on deletion of {}",
            first.device_id(),
            vault.device_id(),
            entity
        );
        let names = |s: &crate::vault::EntitySnapshot| s.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&actual), names(&expected), "field sets differ on {}", vault.device_id());
        for field in &expected.fields {
            let other = actual.field(&field.name).map(|f| (&f.value, &f.op_id));
            assert_eq!(
                other,
                Some((&field.value, &field.op_id)),
                "field '{}' of {} differs between {} and {}",
                field.name,
                entity,
                first.device_id(),
                vault.device_id()
            );
        }
    }
}

/// Assert that the company's audit chain verifies
pub fn assert_chain_intact(vault: &Vault, company: &CompanyId) {
    let verification = assert_ok(vault.verify_audit_chain(company));
    assert!(
        verification.intact,
        "audit chain of {} broken at {:?}: {:?}",
        company, verification.first_broken_seq, verification.reason
    );
}

/// Assert that every head value of `entity` is sealed under `key`
pub fn assert_sealed_under(vault: &Vault, entity: &EntityRef, key: &KeyId) {
    let stored = assert_ok(vault.store().get_entity(entity))
        .unwrap_or_else(|| panic!("{} is not stored", entity));
    let keys = stored.key_ids();
    assert!(
        keys.iter().all(|k| k == key),
        "{} is sealed under {:?}, expected only {}",
        entity,
        keys,
        key
    );
}
