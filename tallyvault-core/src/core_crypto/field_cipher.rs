/*
    field_cipher.rs - Typed field encryption bound to the field's location

    Values are checked against the entity schema before sealing, and the
    (company, kind, entity, field) location is bound as associated data so a
    ciphertext copied into another field or another company fails to open.
*/

use zeroize::Zeroizing;

use super::aead::{self, Algorithm, EncryptedField};
use crate::core_keys::DataKey;
use crate::core_store::model::{EntityRef, FieldValue};
use crate::errors::{VaultError, VaultResult};

/// Seals and opens entity field values
#[derive(Debug, Clone)]
pub struct FieldCipher {
    algorithm: Algorithm,
    max_field_bytes: usize,
}

impl FieldCipher {
    pub fn new(algorithm: Algorithm, max_field_bytes: usize) -> Self {
        FieldCipher {
            algorithm,
            max_field_bytes,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Associated data identifying a field slot
    pub fn field_aad(entity: &EntityRef, field: &str) -> Vec<u8> {
        format!(
            "tallyvault:field:v1|{}|{}|{}|{}",
            entity.company_id,
            entity.kind.as_str(),
            entity.entity_id,
            field
        )
        .into_bytes()
    }

    /// Type-check and encrypt a value for `entity.field`
    pub fn seal(
        &self,
        entity: &EntityRef,
        field: &str,
        value: &FieldValue,
        key: &DataKey,
    ) -> VaultResult<EncryptedField> {
        let spec = entity.kind.field(field)?;
        value.validate_for(spec)?;
        self.check_key_scope(entity, key)?;

        let plaintext = Zeroizing::new(value.to_bytes()?);
        if plaintext.len() > self.max_field_bytes {
            return Err(VaultError::QuotaExceeded(format!(
                "field '{}' is {} bytes, limit is {}",
                field,
                plaintext.len(),
                self.max_field_bytes
            )));
        }
        let sealed = aead::encrypt(&plaintext, key, &Self::field_aad(entity, field), self.algorithm)?;
        crate::metrics::record_counter("crypto.fields.encrypted", 1);
        Ok(sealed)
    }

    /// Decrypt and decode a value sealed for `entity.field`
    pub fn open(
        &self,
        entity: &EntityRef,
        field: &str,
        sealed: &EncryptedField,
        key: &DataKey,
    ) -> VaultResult<FieldValue> {
        self.check_key_scope(entity, key)?;
        let plaintext = aead::decrypt(sealed, key, &Self::field_aad(entity, field))?;
        FieldValue::from_bytes(&plaintext)
    }

    /// Re-encrypt under another key without decoding the value
    pub fn reseal(
        &self,
        entity: &EntityRef,
        field: &str,
        sealed: &EncryptedField,
        from: &DataKey,
        to: &DataKey,
    ) -> VaultResult<EncryptedField> {
        self.check_key_scope(entity, from)?;
        self.check_key_scope(entity, to)?;
        let aad = Self::field_aad(entity, field);
        let plaintext = aead::decrypt(sealed, from, &aad)?;
        aead::encrypt(&plaintext, to, &aad, self.algorithm)
    }

    fn check_key_scope(&self, entity: &EntityRef, key: &DataKey) -> VaultResult<()> {
        if key.company_id() != &entity.company_id {
            return Err(VaultError::Validation(format!(
                "key {} belongs to company {}, not {}",
                key.key_id(),
                key.company_id(),
                entity.company_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_keys::KeyStatus;
    use crate::core_store::model::{CompanyId, EntityId, EntityKind, KeyId};
    use proptest::prelude::*;

    fn key(company: &str, id: &str) -> DataKey {
        DataKey::new(
            KeyId::new(id),
            CompanyId::new(company),
            KeyStatus::Active,
            Zeroizing::new([3u8; 32]),
        )
    }

    fn txn(company: &str, id: &str) -> EntityRef {
        EntityRef::new(CompanyId::new(company), EntityKind::Transaction, EntityId::new(id))
    }

    fn cipher() -> FieldCipher {
        FieldCipher::new(Algorithm::XChaCha20Poly1305, 4096)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = key("acme", "k1");
        let entity = txn("acme", "t1");
        let value = FieldValue::money(129_99, "EUR");
        let sealed = cipher().seal(&entity, "amount", &value, &key).unwrap();
        assert_eq!(cipher().open(&entity, "amount", &sealed, &key).unwrap(), value);
    }

    #[test]
    fn test_schema_enforced_before_encryption() {
        let key = key("acme", "k1");
        let entity = txn("acme", "t1");
        let result = cipher().seal(&entity, "amount", &FieldValue::text("lots"), &key);
        assert!(matches!(result, Err(VaultError::Validation(_))));
    }

    #[test]
    fn test_transplanted_ciphertext_fails() {
        let key = key("acme", "k1");
        let entity = txn("acme", "t1");
        let sealed = cipher()
            .seal(&entity, "memo", &FieldValue::text("secret"), &key)
            .unwrap();
        assert!(matches!(
            cipher().open(&entity, "description", &sealed, &key),
            Err(VaultError::Integrity(_))
        ));
        assert!(matches!(
            cipher().open(&txn("acme", "t2"), "memo", &sealed, &key),
            Err(VaultError::Integrity(_))
        ));
    }

    #[test]
    fn test_foreign_company_key_rejected() {
        let key = key("globex", "k1");
        let result = cipher().seal(&txn("acme", "t1"), "memo", &FieldValue::text("x"), &key);
        assert!(matches!(result, Err(VaultError::Validation(_))));
    }

    #[test]
    fn test_oversized_field_hits_quota() {
        let small = FieldCipher::new(Algorithm::XChaCha20Poly1305, 16);
        let result = small.seal(
            &txn("acme", "t1"),
            "memo",
            &FieldValue::text("x".repeat(64)),
            &key("acme", "k1"),
        );
        assert!(matches!(result, Err(VaultError::QuotaExceeded(_))));
    }

    #[test]
    fn test_reseal_moves_to_new_key() {
        let old = key("acme", "k1");
        let new = DataKey::new(
            KeyId::new("k2"),
            CompanyId::new("acme"),
            KeyStatus::Pending,
            Zeroizing::new([4u8; 32]),
        );
        let entity = txn("acme", "t1");
        let sealed = cipher()
            .seal(&entity, "memo", &FieldValue::text("rent"), &old)
            .unwrap();
        let moved = cipher().reseal(&entity, "memo", &sealed, &old, &new).unwrap();
        assert_eq!(moved.key_id, KeyId::new("k2"));
        assert_eq!(
            cipher().open(&entity, "memo", &moved, &new).unwrap(),
            FieldValue::text("rent")
        );
    }

    proptest! {
        #[test]
        fn prop_any_bit_flip_is_detected(
            text in ".{0,40}",
            flip_tag in any::<bool>(),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let key = key("acme", "k1");
            let entity = txn("acme", "t1");
            let mut sealed = cipher()
                .seal(&entity, "memo", &FieldValue::Text(text.clone()), &key)
                .unwrap();
            prop_assert_eq!(
                cipher().open(&entity, "memo", &sealed, &key).unwrap(),
                FieldValue::Text(text)
            );

            let target = if flip_tag { &mut sealed.auth_tag } else { &mut sealed.ciphertext };
            let i = index.index(target.len());
            target[i] ^= 1 << bit;

            prop_assert!(matches!(
                cipher().open(&entity, "memo", &sealed, &key),
                Err(VaultError::Integrity(_))
            ));
        }
    }
}
