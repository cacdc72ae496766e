//! Batch submission processing
//!
//! Deferred Sigsum signers leave one submission per device. The processor
//! logs them and turns each into a verification record:
//!
//! 1. the verification and processed directories must be empty
//! 2. every submission is loaded and checked before anything is sent
//! 3. per submission: submit, verify the proof, write the verification,
//!    move the submission to the processed directory

use crate::error::AttestError;
use crate::record::Submission;
use crate::sigsum::{LogClient, SigsumLog};
use crate::udi::Udi;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BatchDirs {
    pub submissions: PathBuf,
    pub processed: PathBuf,
    pub verifications: PathBuf,
}

fn is_empty_dir(dir: &Path) -> Result<bool, AttestError> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

impl BatchDirs {
    fn check(&self) -> Result<(), AttestError> {
        if !is_empty_dir(&self.verifications)? {
            return Err(AttestError::DirectoryNotEmpty("verification"));
        }
        if !is_empty_dir(&self.processed)? {
            return Err(AttestError::DirectoryNotEmpty("processed submission"));
        }
        Ok(())
    }
}

struct Pending {
    name: String,
    path: PathBuf,
    submission: Submission,
}

fn invalid(path: &Path, reason: impl ToString) -> AttestError {
    AttestError::InvalidSubmission {
        file: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn load(path: &Path, log: &SigsumLog) -> Result<Submission, AttestError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid(path, "file name is not UTF-8"))?;
    Udi::from_hex(name).map_err(|e| invalid(path, format!("file name is not a UDI: {}", e)))?;
    let submission = Submission::from_file(path).map_err(|e| invalid(path, e))?;
    let key = log
        .submit_key(&submission.request.key_hash())
        .ok_or_else(|| invalid(path, "signed by an unknown submit key"))?;
    key.check_app(&submission.app_tag, &submission.app_hash)
        .map_err(|e| invalid(path, e))?;
    Ok(submission)
}

fn load_all(dir: &Path, log: &SigsumLog) -> Result<Vec<Pending>, AttestError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() || entry.file_name().to_string_lossy().starts_with('.') {
            log::debug!("Skipping {}", entry.path().display());
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let submission = load(&path, log)?;
            let name = submission_name(&path)?;
            Ok(Pending {
                name,
                path,
                submission,
            })
        })
        .collect()
}

fn submission_name(path: &Path) -> Result<String, AttestError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| invalid(path, "file name is not UTF-8"))
}

/// Log every submission in `dirs.submissions` and write verification records.
/// Returns the paths of the records written.
pub fn process_submissions(
    dirs: &BatchDirs,
    log: &SigsumLog,
    client: &LogClient<'_>,
) -> Result<Vec<PathBuf>, AttestError> {
    dirs.check()?;
    let pending = load_all(&dirs.submissions, log)?;
    if pending.is_empty() {
        log::info!("No submissions in {}", dirs.submissions.display());
        return Ok(Vec::new());
    }
    log::info!(
        "Submitting {} leaves to {}",
        pending.len(),
        client.url()
    );

    let mut written = Vec::with_capacity(pending.len());
    for p in pending {
        let proof = client.submit(&p.submission.request)?;
        let key = log.verify_proof(&proof, &p.submission.request.message)?;
        log::debug!("{}: proof verified for submit key {}", p.name, key.name);

        let target = dirs.verifications.join(&p.name);
        p.submission.into_record(proof).to_file(&target)?;
        let done = dirs.processed.join(&p.name);
        if let Err(e) = fs::rename(&p.path, &done) {
            log::error!(
                "{}: wrote {} but could not move {} to {}: {}",
                p.name,
                target.display(),
                p.path.display(),
                done.display(),
                e
            );
            return Err(e.into());
        }
        log::info!("Wrote {}", target.display());
        written.push(target);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VerificationRecord;
    use crate::sigsum::client::testlog::TestLog;
    use crate::sigsum::proof::testutil::Keys;
    use crate::sigsum::{LeafRequest, SubmitKey};
    use crate::time::from_unix;
    use std::time::Duration;

    const TAG: &str = "verisigner-v0.0.3";

    fn scratch(name: &str) -> BatchDirs {
        let dir = std::env::temp_dir().join(format!("devattest_batch_{}_{}", std::process::id(), name));
        fs::remove_dir_all(&dir).ok();
        let dirs = BatchDirs {
            submissions: dir.join("submissions"),
            processed: dir.join("processed"),
            verifications: dir.join("verifications"),
        };
        for d in [&dirs.submissions, &dirs.processed, &dirs.verifications] {
            fs::create_dir_all(d).unwrap();
        }
        dirs
    }

    fn cleanup(dirs: &BatchDirs) {
        if let Some(parent) = dirs.submissions.parent() {
            fs::remove_dir_all(parent).ok();
        }
    }

    fn sigsum_log(keys: &Keys) -> SigsumLog {
        let key = SubmitKey {
            name: "batch".to_string(),
            public_key: *keys.submit.pk,
            tag: TAG.to_string(),
            app_hash: [7u8; 64],
            validity: None,
        };
        SigsumLog::new(vec![key], keys.policy()).unwrap()
    }

    fn submission(keys: &Keys, message: [u8; 32]) -> Submission {
        Submission {
            timestamp: from_unix(1_756_811_232).unwrap(),
            app_tag: TAG.to_string(),
            app_hash: [7u8; 64],
            request: LeafRequest {
                message,
                signature: *keys.submit.sk.sign(LeafRequest::signed_data(&message), None),
                public_key: *keys.submit.pk,
            },
        }
    }

    fn test_log(keys: &Keys) -> TestLog {
        TestLog::new(keys.log.clone(), keys.witness.clone(), 1_756_811_283, 1)
    }

    #[test]
    fn test_process_two() {
        let keys = Keys::new();
        let log = sigsum_log(&keys);
        let dirs = scratch("two");
        submission(&keys, [1u8; 32])
            .to_file(dirs.submissions.join("0133708100000001"))
            .unwrap();
        let original = fs::read(dirs.submissions.join("0133708100000001")).unwrap();
        submission(&keys, [2u8; 32])
            .to_file(dirs.submissions.join("0133708100000002"))
            .unwrap();

        let testlog = test_log(&keys);
        let client = LogClient::new(&testlog, &log.policy().logs()[0], Some("http://log.test"))
            .unwrap()
            .with_polling(Duration::from_millis(1), 5);
        let written = process_submissions(&dirs, &log, &client).unwrap();
        assert_eq!(written.len(), 2);

        let record = VerificationRecord::from_file(dirs.verifications.join("0133708100000002")).unwrap();
        let crate::record::Attestation::Proof(proof) = record.attestation else {
            panic!("expected a proof record");
        };
        log.verify_proof(&proof, &[2u8; 32]).unwrap();
        assert!(is_empty_dir(&dirs.submissions).unwrap());
        assert_eq!(fs::read(dirs.processed.join("0133708100000001")).unwrap(), original);

        // a second run refuses to touch the filled directories
        assert!(matches!(
            process_submissions(&dirs, &log, &client),
            Err(AttestError::DirectoryNotEmpty("verification"))
        ));
        cleanup(&dirs);
    }

    #[test]
    fn test_invalid_submission_touches_nothing() {
        let keys = Keys::new();
        let log = sigsum_log(&keys);
        let dirs = scratch("invalid");
        submission(&keys, [1u8; 32])
            .to_file(dirs.submissions.join("0133708100000001"))
            .unwrap();
        let mut bad = submission(&keys, [2u8; 32]);
        bad.request.signature[0] ^= 1;
        let json = String::from_utf8(bad.to_json().unwrap()).unwrap();
        fs::write(dirs.submissions.join("0133708100000002"), json).unwrap();

        let testlog = test_log(&keys);
        let client = LogClient::new(&testlog, &log.policy().logs()[0], Some("http://log.test")).unwrap();
        let err = process_submissions(&dirs, &log, &client).unwrap_err();
        assert!(matches!(err, AttestError::InvalidSubmission { .. }));
        assert!(err.to_string().starts_with("invalid submission file"));
        assert!(is_empty_dir(&dirs.verifications).unwrap());
        assert!(is_empty_dir(&dirs.processed).unwrap());
        assert_eq!(fs::read_dir(&dirs.submissions).unwrap().count(), 2);
        cleanup(&dirs);
    }

    #[test]
    fn test_wrong_app_and_name() {
        let keys = Keys::new();
        let log = sigsum_log(&keys);
        let dirs = scratch("wrongapp");
        let mut sub = submission(&keys, [1u8; 32]);
        sub.app_tag = "other-app".to_string();
        sub.to_file(dirs.submissions.join("0133708100000001")).unwrap();
        let testlog = test_log(&keys);
        let client = LogClient::new(&testlog, &log.policy().logs()[0], Some("http://log.test")).unwrap();
        assert!(matches!(
            process_submissions(&dirs, &log, &client),
            Err(AttestError::InvalidSubmission { .. })
        ));

        fs::remove_file(dirs.submissions.join("0133708100000001")).unwrap();
        submission(&keys, [1u8; 32])
            .to_file(dirs.submissions.join("not-a-udi"))
            .unwrap();
        assert!(matches!(
            process_submissions(&dirs, &log, &client),
            Err(AttestError::InvalidSubmission { .. })
        ));
        cleanup(&dirs);
    }

    fn snapshot(dirs: &BatchDirs) -> Vec<Vec<(String, Vec<u8>)>> {
        [&dirs.submissions, &dirs.processed, &dirs.verifications]
            .iter()
            .map(|dir| {
                let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
                    .unwrap()
                    .map(|e| {
                        let e = e.unwrap();
                        (
                            e.file_name().to_string_lossy().into_owned(),
                            fs::read(e.path()).unwrap(),
                        )
                    })
                    .collect();
                files.sort();
                files
            })
            .collect()
    }

    #[test]
    fn test_leftover_verification_leaves_all_dirs_alone() {
        let keys = Keys::new();
        let log = sigsum_log(&keys);
        let dirs = scratch("leftover");
        submission(&keys, [1u8; 32])
            .to_file(dirs.submissions.join("0133708100000001"))
            .unwrap();
        fs::write(dirs.verifications.join("0133708100000009"), b"{}").unwrap();
        let before = snapshot(&dirs);

        let testlog = test_log(&keys);
        let client = LogClient::new(&testlog, &log.policy().logs()[0], Some("http://log.test")).unwrap();
        let err = process_submissions(&dirs, &log, &client).unwrap_err();
        assert_eq!(err.to_string(), "verification directory must be empty");
        assert_eq!(snapshot(&dirs), before);
        assert_eq!(before[0].len(), 1);
        assert_eq!(before[2].len(), 1);
        cleanup(&dirs);
    }

    #[test]
    fn test_processed_dir_must_be_empty() {
        let keys = Keys::new();
        let log = sigsum_log(&keys);
        let dirs = scratch("processed");
        fs::write(dirs.processed.join("leftover"), b"x").unwrap();
        let testlog = test_log(&keys);
        let client = LogClient::new(&testlog, &log.policy().logs()[0], Some("http://log.test")).unwrap();
        let err = process_submissions(&dirs, &log, &client).unwrap_err();
        assert_eq!(err.to_string(), "processed submission directory must be empty");
        cleanup(&dirs);
    }
}
