// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

#![allow(clippy::panic_in_result_fn)]

mod common;

use std::thread;

use common::{DES2_KEY, des2_template, fixture, kcv, rw_flags};
use cosmian_soft_token::{
    Attribute, AttributeSet, AttributeType, KeyType, LoginState, Mechanism, MechanismType,
    ObjectClass, OperationKind, SessionFlags, SessionState, Slot, TokenConfig, TokenError,
    TokenResult, UserType, logging::log_init,
};
use cryptoki_sys::{
    CK_RV, CKR_KEY_SIZE_RANGE, CKR_OPERATION_ACTIVE, CKR_PIN_INCORRECT, CKR_SESSION_READ_ONLY,
    CKR_USER_NOT_LOGGED_IN,
};

fn slot() -> TokenResult<Slot> {
    log_init("info,cosmian_soft_token=debug");
    Slot::with_openssl(TokenConfig::from_toml_str(
        r#"
slot_id = 3
label = "lifecycle"
user_pin = "1234"
so_pin = "5678"
max_sessions = 4
"#,
    )?)
}

fn data_object(label: &str) -> AttributeSet {
    AttributeSet::from([
        Attribute::Class(ObjectClass::Data),
        Attribute::Label(label.to_owned()),
        Attribute::Value(label.as_bytes().to_vec()),
    ])
}

fn label_query(label: &str) -> AttributeSet {
    AttributeSet::from([Attribute::Label(label.to_owned())])
}

#[test]
fn login_and_logout() -> TokenResult<()> {
    let slot = slot()?;
    let mut session = slot.open_session(rw_flags())?;
    assert_eq!(session.info().state, SessionState::RwPublic);

    assert!(matches!(
        session.login(UserType::User, "0000"),
        Err(TokenError::PinIncorrect)
    ));
    assert!(matches!(
        session.login(UserType::User, "12345"),
        Err(TokenError::PinIncorrect)
    ));
    assert_eq!(session.login_state(), LoginState::NotLoggedIn);

    session.login(UserType::User, "1234")?;
    assert_eq!(session.login_state(), LoginState::User);
    assert_eq!(session.info().state, SessionState::RwUser);
    assert!(matches!(
        session.login(UserType::SecurityOfficer, "5678"),
        Err(TokenError::UserAlreadyLoggedIn)
    ));

    session.logout()?;
    assert!(matches!(
        session.logout(),
        Err(TokenError::PermissionDenied(_))
    ));
    session.login(UserType::SecurityOfficer, "5678")?;
    assert_eq!(session.info().state, SessionState::RwSecurityOfficer);
    Ok(())
}

#[test]
fn private_objects_need_a_user_login() -> TokenResult<()> {
    let slot = slot()?;
    let mut owner = slot.open_session(rw_flags())?;
    let mut other = slot.open_session(rw_flags())?;

    assert!(matches!(
        owner.create_object(&data_object("hidden").with(Attribute::Private(true))),
        Err(TokenError::PermissionDenied(_))
    ));
    owner.login(UserType::User, "1234")?;
    let hidden = owner.create_object(
        &data_object("hidden")
            .with(Attribute::Token(true))
            .with(Attribute::Private(true)),
    )?;
    let shown = owner.create_object(&data_object("shown").with(Attribute::Token(true)))?;

    assert!(other.find_objects(&label_query("hidden"))?.is_empty());
    assert_eq!(other.find_objects(&label_query("shown"))?, vec![shown]);
    assert!(matches!(
        other.get_attribute(hidden, AttributeType::Label),
        Err(TokenError::PermissionDenied(_))
    ));
    assert!(matches!(
        other.destroy_object(hidden),
        Err(TokenError::PermissionDenied(_))
    ));

    // the security officer does not see user objects either
    other.login(UserType::SecurityOfficer, "5678")?;
    assert!(other.find_objects(&label_query("hidden"))?.is_empty());
    other.logout()?;

    other.login(UserType::User, "1234")?;
    assert_eq!(other.find_objects(&label_query("hidden"))?, vec![hidden]);
    assert_eq!(
        other.get_attribute(hidden, AttributeType::Value)?,
        Some(Attribute::Value(b"hidden".to_vec()))
    );
    Ok(())
}

#[test]
fn read_only_sessions() -> TokenResult<()> {
    let slot = slot()?;
    let mut rw = slot.open_session(rw_flags())?;
    let token_object = rw.create_object(&data_object("on token").with(Attribute::Token(true)))?;

    let mut ro = slot.open_session(SessionFlags::SERIAL_SESSION)?;
    assert_eq!(ro.info().state, SessionState::RoPublic);
    assert!(matches!(
        ro.create_object(&data_object("ro").with(Attribute::Token(true))),
        Err(TokenError::SessionReadOnly)
    ));
    let session_object = ro.create_object(&data_object("ro"))?;
    ro.set_attribute(session_object, Attribute::Label("still ro".to_owned()))?;
    assert!(matches!(
        ro.set_attribute(token_object, Attribute::Label("changed".to_owned())),
        Err(TokenError::SessionReadOnly)
    ));
    assert!(matches!(
        ro.destroy_object(token_object),
        Err(TokenError::SessionReadOnly)
    ));
    ro.destroy_object(session_object)?;

    assert!(matches!(
        ro.login(UserType::SecurityOfficer, "5678"),
        Err(TokenError::SessionReadOnly)
    ));
    ro.login(UserType::User, "1234")?;
    assert_eq!(ro.info().state, SessionState::RoUser);
    Ok(())
}

#[test]
fn one_operation_at_a_time() -> TokenResult<()> {
    let mut f = fixture()?;
    let sha256 = Mechanism::new(MechanismType::Sha256);

    assert!(matches!(
        f.session.digest_update(b"data"),
        Err(TokenError::OperationNotInitialized(_))
    ));
    f.session.digest_init(&sha256)?;
    assert!(matches!(
        f.session.digest_init(&sha256),
        Err(TokenError::OperationInProgress(_))
    ));
    assert!(matches!(
        f.session
            .encrypt_init(&Mechanism::new(MechanismType::Des3Ecb), f.des2_key),
        Err(TokenError::OperationInProgress(_))
    ));
    // a call for another kind of operation leaves the digest running
    assert!(matches!(
        f.session.encrypt_update(b"data"),
        Err(TokenError::OperationNotInitialized(_))
    ));
    assert_eq!(
        f.session.active_operation(),
        Some((OperationKind::Digest, MechanismType::Sha256))
    );
    f.session.digest_update(b"data")?;
    assert_eq!(f.session.digest_final()?.len(), 32);
    assert_eq!(f.session.active_operation(), None);
    assert!(matches!(
        f.session.digest_final(),
        Err(TokenError::OperationNotInitialized(_))
    ));

    // a failed call terminates the operation
    f.session
        .encrypt_init(&Mechanism::new(MechanismType::Des3Ecb), f.des2_key)?;
    f.session.encrypt_update(b"12345")?;
    assert!(matches!(
        f.session.encrypt_final(),
        Err(TokenError::DataLengthInvalid(_))
    ));
    assert_eq!(f.session.active_operation(), None);

    // logging out terminates it too
    f.session
        .sign_init(&Mechanism::new(MechanismType::Sha1RsaPkcs), f.private_key)?;
    f.session.logout()?;
    assert_eq!(f.session.active_operation(), None);
    assert!(matches!(
        f.session.sign_final(),
        Err(TokenError::OperationNotInitialized(_))
    ));
    Ok(())
}

#[test]
fn private_keys_need_a_user_login() -> TokenResult<()> {
    let mut f = fixture()?;
    f.session.logout()?;
    assert!(matches!(
        f.session
            .sign(&Mechanism::new(MechanismType::Sha256RsaPkcs), f.private_key, b"data"),
        Err(TokenError::PermissionDenied(_))
    ));
    // the public half stays usable
    let ciphertext = f.session.encrypt(
        &Mechanism::new(MechanismType::RsaPkcs),
        f.public_key,
        b"data",
    )?;
    assert_eq!(ciphertext.len(), 128);
    Ok(())
}

#[test]
fn closing_a_session_destroys_its_objects() -> TokenResult<()> {
    let slot = slot()?;
    let mut first = slot.open_session(rw_flags())?;
    let second = slot.open_session(rw_flags())?;
    assert_eq!(slot.session_count(), 2);

    let session_object = first.create_object(&des2_template(DES2_KEY))?;
    let token_object =
        first.create_object(&des2_template(DES2_KEY).with(Attribute::Token(true)))?;
    assert_ne!(session_object, token_object);
    assert!(matches!(
        second.get_attribute(session_object, AttributeType::Label),
        Err(TokenError::InvalidHandle(h)) if h == session_object
    ));
    assert_eq!(
        second.get_attribute(token_object, AttributeType::KeyType)?,
        Some(Attribute::KeyType(KeyType::Des2))
    );

    first.close();
    assert_eq!(slot.session_count(), 1);
    assert_eq!(slot.token_object_count()?, 1);
    assert_eq!(
        second.find_objects(&AttributeSet::from([Attribute::Class(ObjectClass::SecretKey)]))?,
        vec![token_object]
    );

    let mut third = slot.open_session(rw_flags())?;
    assert!(matches!(
        third.destroy_object(session_object),
        Err(TokenError::InvalidHandle(_))
    ));
    third.destroy_object(token_object)?;
    assert_eq!(slot.token_object_count()?, 0);
    Ok(())
}

#[test]
fn session_limit_and_token_info() -> TokenResult<()> {
    let slot = slot()?;
    assert_eq!(slot.id(), 3);
    let sessions = (0..4)
        .map(|_| slot.open_session(SessionFlags::SERIAL_SESSION))
        .collect::<TokenResult<Vec<_>>>()?;
    assert!(matches!(
        slot.open_session(rw_flags()),
        Err(TokenError::SessionCount(4))
    ));
    let info = slot.info();
    assert_eq!(info.label, "lifecycle");
    assert_eq!((info.session_count, info.max_session_count), (4, 4));
    assert!(sessions.iter().all(|s| s.info().slot_id == 3));

    drop(sessions);
    assert_eq!(slot.session_count(), 0);
    let session = slot.open_session(rw_flags())?;
    let random = session.generate_random(32)?;
    assert_eq!(random.len(), 32);
    assert_ne!(random, session.generate_random(32)?);
    Ok(())
}

#[test]
fn find_objects_in_pages() -> TokenResult<()> {
    let slot = slot()?;
    let mut session = slot.open_session(rw_flags())?;
    let mut created = Vec::new();
    for _ in 0..5 {
        created.push(session.create_object(&data_object("page"))?);
    }
    session.create_object(&data_object("elsewhere"))?;

    assert!(matches!(
        session.find_objects_next(2),
        Err(TokenError::OperationNotInitialized(_))
    ));
    session.find_objects_init(&label_query("page"))?;
    assert!(matches!(
        session.find_objects_init(&label_query("page")),
        Err(TokenError::OperationInProgress(_))
    ));
    let mut found = Vec::new();
    for expected in [2, 2, 1, 0] {
        let page = session.find_objects_next(2)?;
        assert_eq!(page.len(), expected);
        found.extend(page);
    }
    assert_eq!(found, created);
    session.find_objects_final()?;
    assert!(matches!(
        session.find_objects_final(),
        Err(TokenError::OperationNotInitialized(_))
    ));

    // an empty query matches everything visible
    assert_eq!(session.find_objects(&AttributeSet::new())?.len(), 6);
    Ok(())
}

#[test]
fn attribute_updates() -> TokenResult<()> {
    let mut f = fixture()?;
    let key = f.des2_key;

    f.session
        .set_attribute(key, Attribute::Label("renamed".to_owned()))?;
    assert_eq!(
        f.session.get_attribute(key, AttributeType::Label)?,
        Some(Attribute::Label("renamed".to_owned()))
    );
    assert_eq!(
        f.session.find_objects(&label_query("renamed"))?,
        vec![key]
    );

    for attribute in [
        Attribute::Class(ObjectClass::Data),
        Attribute::KeyType(KeyType::Des3),
        Attribute::Value(vec![0; 16]),
        Attribute::ValueLen(24),
        Attribute::Local(true),
        Attribute::AlwaysSensitive(true),
    ] {
        let attribute_type = attribute.attribute_type();
        assert!(matches!(
            f.session.set_attribute(key, attribute),
            Err(TokenError::AttributeReadOnly(t)) if t == attribute_type
        ));
    }
    assert!(matches!(
        f.session
            .set_attribute(key, Attribute::Application("app".to_owned())),
        Err(TokenError::InvalidAttribute(_))
    ));

    // SENSITIVE is one-way, so is EXTRACTABLE
    f.session.set_attribute(key, Attribute::Sensitive(true))?;
    assert!(matches!(
        f.session.set_attribute(key, Attribute::Sensitive(false)),
        Err(TokenError::AttributeReadOnly(AttributeType::Sensitive))
    ));
    f.session.set_attribute(key, Attribute::Extractable(false))?;
    assert!(matches!(
        f.session.set_attribute(key, Attribute::Extractable(true)),
        Err(TokenError::AttributeReadOnly(AttributeType::Extractable))
    ));

    let frozen = f
        .session
        .create_object(&data_object("frozen").with(Attribute::Modifiable(false)))?;
    assert!(matches!(
        f.session
            .set_attribute(frozen, Attribute::Label("thawed".to_owned())),
        Err(TokenError::AttributeReadOnly(AttributeType::Label))
    ));
    Ok(())
}

#[test]
fn object_templates_are_validated() -> TokenResult<()> {
    let slot = slot()?;
    let mut session = slot.open_session(rw_flags())?;

    let cases = [
        (
            AttributeSet::from([Attribute::Label("no class".to_owned())]),
            "TemplateIncomplete",
        ),
        (
            AttributeSet::from([
                Attribute::Class(ObjectClass::SecretKey),
                Attribute::Value(DES2_KEY.to_vec()),
            ]),
            "TemplateIncomplete",
        ),
        (
            AttributeSet::from([
                Attribute::Class(ObjectClass::SecretKey),
                Attribute::KeyType(KeyType::Des2),
            ]),
            "TemplateIncomplete",
        ),
        (
            AttributeSet::from([
                Attribute::Class(ObjectClass::PublicKey),
                Attribute::KeyType(KeyType::Rsa),
                Attribute::PublicExponent(vec![1, 0, 1]),
            ]),
            "TemplateIncomplete",
        ),
        (
            data_object("typed").with(Attribute::KeyType(KeyType::Aes)),
            "AttributeConflict",
        ),
        (
            des2_template(DES2_KEY).with(Attribute::KeyType(KeyType::Rsa)),
            "AttributeConflict",
        ),
        (
            des2_template(DES2_KEY).with(Attribute::Local(true)),
            "AttributeConflict",
        ),
        (
            des2_template(DES2_KEY).with(Attribute::ValueLen(24)),
            "AttributeConflict",
        ),
        (des2_template(&DES2_KEY[..8]), "AttributeValueInvalid"),
        (
            des2_template(DES2_KEY).with(Attribute::AlwaysSensitive(true)),
            "AttributeReadOnly",
        ),
        (
            data_object("modulus").with(Attribute::Modulus(vec![0xff; 64])),
            "InvalidAttribute",
        ),
    ];
    for (template, expected) in cases {
        let result = session.create_object(&template);
        let actual = match &result {
            Err(TokenError::TemplateIncomplete(_)) => "TemplateIncomplete",
            Err(TokenError::AttributeConflict(_)) => "AttributeConflict",
            Err(TokenError::AttributeValueInvalid(..)) => "AttributeValueInvalid",
            Err(TokenError::AttributeReadOnly(_)) => "AttributeReadOnly",
            Err(TokenError::InvalidAttribute(_)) => "InvalidAttribute",
            Err(_) => "another error",
            Ok(_) => "success",
        };
        assert_eq!(actual, expected, "{template:?}: {result:?}");
    }
    assert!(session.find_objects(&AttributeSet::new())?.is_empty());

    let key = session.create_object(&des2_template(DES2_KEY))?;
    assert_eq!(
        session.get_attribute(key, AttributeType::ValueLen)?,
        Some(Attribute::ValueLen(16))
    );
    assert!(!common::bool_attribute(&session, key, AttributeType::Local)?);
    assert!(!common::bool_attribute(&session, key, AttributeType::Sign)?);
    assert_eq!(session.get_attribute(key, AttributeType::Modulus)?, None);
    session.destroy_object(key)?;
    assert!(matches!(
        session.destroy_object(key),
        Err(TokenError::InvalidHandle(_))
    ));
    Ok(())
}

#[test]
fn protected_key_material_is_not_searchable() -> TokenResult<()> {
    let mut f = fixture()?;
    let sensitive = f.session.create_object(
        &des2_template(DES2_KEY)
            .with(Attribute::Label("sensitive".to_owned()))
            .with(Attribute::Sensitive(true)),
    )?;
    let locked = f.session.create_object(
        &des2_template(DES2_KEY)
            .with(Attribute::Label("locked".to_owned()))
            .with(Attribute::Token(true))
            .with(Attribute::Extractable(false)),
    )?;

    // only the readable copy answers a query on the value
    let by_value = AttributeSet::from([Attribute::Value(DES2_KEY.to_vec())]);
    assert_eq!(f.session.find_objects(&by_value)?, vec![f.des2_key]);
    let wrong_guess = AttributeSet::from([Attribute::Value(b"fedcba9876543210".to_vec())]);
    assert!(f.session.find_objects(&wrong_guess)?.is_empty());
    for (label, handle) in [("sensitive", sensitive), ("locked", locked)] {
        assert_eq!(f.session.find_objects(&label_query(label))?, vec![handle]);
        assert!(
            f.session
                .find_objects(&label_query(label).with(Attribute::Value(DES2_KEY.to_vec())))?
                .is_empty()
        );
    }
    assert!(matches!(
        f.session.get_attribute(sensitive, AttributeType::Value),
        Err(TokenError::SensitiveAttributeDenied(AttributeType::Value))
    ));
    // the keys stay usable
    assert_eq!(kcv(&mut f.session, sensitive)?, kcv(&mut f.session, f.des2_key)?);
    Ok(())
}

fn is_send<T: Send>() {}
fn is_shared<T: Clone + Send + Sync>() {}

#[test]
fn sessions_on_parallel_threads() -> TokenResult<()> {
    is_send::<cosmian_soft_token::Session>();
    is_shared::<Slot>();

    log_init("info,cosmian_soft_token=debug");
    let slot = Slot::with_openssl(TokenConfig {
        max_sessions: 16,
        ..TokenConfig::default()
    })?;
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let slot = slot.clone();
            thread::spawn(move || -> TokenResult<Vec<u8>> {
                let mut session = slot.open_session(rw_flags())?;
                let key = session.create_object(
                    &des2_template(DES2_KEY)
                        .with(Attribute::Token(true))
                        .with(Attribute::Label(format!("worker {i}"))),
                )?;
                kcv(&mut session, key)
            })
        })
        .collect();
    for worker in workers {
        let check_value = worker
            .join()
            .map_err(|_| TokenError::Default("worker thread panicked".to_owned()))??;
        assert_eq!(hex::encode(check_value), "761fd098576a0e80");
    }
    // the sessions are closed, their token objects remain
    assert_eq!(slot.session_count(), 0);
    assert_eq!(slot.token_object_count()?, 8);

    let session = slot.open_session(SessionFlags::SERIAL_SESSION)?;
    let mut labels = Vec::new();
    let secret_keys = AttributeSet::from([Attribute::Class(ObjectClass::SecretKey)]);
    for handle in session.find_objects(&secret_keys)? {
        if let Some(Attribute::Label(label)) =
            session.get_attribute(handle, AttributeType::Label)?
        {
            labels.push(label);
        }
    }
    labels.sort();
    assert_eq!(labels, (0..8).map(|i| format!("worker {i}")).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn errors_map_to_return_values() {
    assert_eq!(CK_RV::from(TokenError::PinIncorrect), CKR_PIN_INCORRECT);
    assert_eq!(CK_RV::from(TokenError::SessionReadOnly), CKR_SESSION_READ_ONLY);
    assert_eq!(
        CK_RV::from(TokenError::PermissionDenied("login required".to_owned())),
        CKR_USER_NOT_LOGGED_IN
    );
    assert_eq!(
        CK_RV::from(TokenError::OperationInProgress("digest".to_owned())),
        CKR_OPERATION_ACTIVE
    );
    // context does not hide the cause
    assert_eq!(
        CK_RV::from(
            TokenError::KeySizeRange("16 bits".to_owned())
                .context("generating a key")
                .context("outer")
        ),
        CKR_KEY_SIZE_RANGE
    );
}
