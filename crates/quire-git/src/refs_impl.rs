//! gix-backed ref and rev-parse operations.

use gix::refs::transaction::{Change, LogChange, PreviousValue, RefLog};
use gix::refs::{FullName, Target};

use crate::error::GitError;
use crate::gix_repo::{GixRepo, from_gix_oid, to_gix_oid};
use crate::types::{GitOid, RefEdit, RefName, Signature};

fn full_name(name: &RefName) -> Result<FullName, GitError> {
    name.as_str()
        .try_into()
        .map_err(|e: gix::validate::reference::name::Error| GitError::BackendError {
            message: format!("ref name {name}: {e}"),
        })
}

pub fn atomic_ref_update(
    repo: &GixRepo,
    edits: &[RefEdit],
    committer: &Signature,
) -> Result<(), GitError> {
    let gix_edits = edits
        .iter()
        .map(|edit| {
            let expected = if edit.expected_old_oid.is_zero() {
                PreviousValue::MustNotExist
            } else {
                PreviousValue::MustExistAndMatch(Target::Object(to_gix_oid(edit.expected_old_oid)))
            };
            Ok(gix::refs::transaction::RefEdit {
                change: Change::Update {
                    log: LogChange {
                        mode: RefLog::AndReference,
                        force_create_reflog: false,
                        message: edit.log_message.as_str().into(),
                    },
                    expected,
                    new: Target::Object(to_gix_oid(edit.new_oid)),
                },
                name: full_name(&edit.name)?,
                deref: false,
            })
        })
        .collect::<Result<Vec<_>, GitError>>()?;

    let committer = gix::actor::Signature {
        name: committer.name.as_str().into(),
        email: committer.email.as_str().into(),
        time: gix::date::Time::now_local_or_utc(),
    };
    let mut time_buf = gix::date::parse::TimeBuf::default();
    repo.repo
        .edit_references_as(gix_edits, Some(committer.to_ref(&mut time_buf)))
        .map_err(|e| classify_edit_error(edits, &e.to_string()))?;
    Ok(())
}

fn classify_edit_error(edits: &[RefEdit], msg: &str) -> GitError {
    // gix reports CAS mismatches only through the message text.
    let lower = msg.to_ascii_lowercase();
    if lower.contains("existing object id")
        || lower.contains("did not match")
        || lower.contains("mustnotexist")
        || lower.contains("mustexistandmatch")
        || lower.contains("already exists")
    {
        GitError::RefConflict {
            ref_name: edits
                .first()
                .map(|e| e.name.as_str().to_owned())
                .unwrap_or_default(),
            message: msg.to_owned(),
        }
    } else {
        GitError::BackendError {
            message: msg.to_owned(),
        }
    }
}

pub fn head_branch(repo: &GixRepo) -> Result<Option<RefName>, GitError> {
    let name = repo.repo.head_name().map_err(|e| GitError::BackendError {
        message: format!("read HEAD: {e}"),
    })?;
    Ok(name.and_then(|n| RefName::new(&n.as_bstr().to_string()).ok()))
}

pub fn set_head_branch(repo: &GixRepo, branch: &RefName) -> Result<(), GitError> {
    let head: FullName = "HEAD"
        .try_into()
        .map_err(|e: gix::validate::reference::name::Error| GitError::BackendError {
            message: e.to_string(),
        })?;
    let edit = gix::refs::transaction::RefEdit {
        change: Change::Update {
            log: LogChange {
                mode: RefLog::AndReference,
                force_create_reflog: false,
                message: format!("point HEAD at {branch}").into(),
            },
            expected: PreviousValue::Any,
            new: Target::Symbolic(full_name(branch)?),
        },
        name: head,
        deref: false,
    };
    // A symbolic update writes no reflog, so no committer is needed.
    repo.repo
        .edit_references_as(Some(edit), None)
        .map_err(|e| GitError::BackendError {
            message: format!("set HEAD to {branch}: {e}"),
        })?;
    Ok(())
}

pub fn rev_parse_opt(repo: &GixRepo, spec: &str) -> Result<Option<GitOid>, GitError> {
    // Every rev-parse failure is a resolution failure (missing ref, unborn
    // HEAD, malformed spec), so all of them map to None.
    Ok(repo
        .repo
        .rev_parse_single(spec)
        .ok()
        .map(|id| from_gix_oid(&id)))
}
