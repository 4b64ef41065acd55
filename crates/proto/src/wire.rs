//! Wire codec for the signed payload exchanges.
//!
//! Job lists and result batches travel as one frame each: a big-endian
//! u32 length followed by the bincode encoding of the sequence. Frames
//! are written and read *through the session*, so every byte lands in
//! the running hash and is covered by the following signature.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::session::{Session, SessionError};
use crate::MAX_FRAME;

/// Description of one job as shipped to a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: u64,
    /// Period in seconds.
    pub period: u32,
    /// Offset in seconds; the job runs at Unix time `N * period + start`.
    pub start: u32,
    /// The check to run, e.g. `["http", "get", "http://x.example/"]`.
    pub check: Vec<String>,
}

impl JobSpec {
    /// The check tokens joined for the `cmd` database column.
    pub fn cmd(&self) -> String {
        self.check.join(" ")
    }
}

/// Encodes `value` and writes it as one hashed frame.
pub async fn send_frame<S, T>(session: &mut Session<S>, value: &T) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME {
        return Err(SessionError::FrameTooLarge(body.len()));
    }
    session.write_all(&(body.len() as u32).to_be_bytes()).await?;
    session.write_all(&body).await?;
    Ok(())
}

/// Reads one hashed frame and decodes it.
pub async fn recv_frame<S, T>(session: &mut Session<S>) -> Result<T, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    session.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(SessionError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    session.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchnet_common::CheckResult;

    const KEY: [u8; 32] = [7u8; 32];

    fn specs() -> Vec<JobSpec> {
        vec![
            JobSpec {
                id: 1,
                period: 60,
                start: 0,
                check: vec!["dns".into(), "x.example".into()],
            },
            JobSpec {
                id: 2,
                period: 300,
                start: 30,
                check: vec!["http".into(), "get".into(), "http://x.example/".into()],
            },
        ]
    }

    #[tokio::test]
    async fn framed_joblist_roundtrip_with_signatures() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut sa = Session::new(a);
        let mut sb = Session::new(b);
        sa.set_key(&KEY).unwrap();
        sb.set_key(&KEY).unwrap();
        sa.send_challenge(b"").await.unwrap();
        sb.receive_challenge().await.unwrap();
        sb.send_challenge(b"").await.unwrap();
        sa.receive_challenge().await.unwrap();

        let jobs = specs();
        send_frame(&mut sa, &jobs).await.unwrap();
        sa.send_sig().await.unwrap();

        let got: Vec<JobSpec> = recv_frame(&mut sb).await.unwrap();
        sb.check_sig().await.unwrap();
        assert_eq!(got, jobs);

        // reply direction: an empty result batch
        let batch: Vec<CheckResult> = vec![];
        send_frame(&mut sb, &batch).await.unwrap();
        sb.send_sig().await.unwrap();
        let got: Vec<CheckResult> = recv_frame(&mut sa).await.unwrap();
        sa.check_sig().await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut raw, b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let mut s = Session::new(b);
        let err = recv_frame::<_, Vec<JobSpec>>(&mut s).await.unwrap_err();
        assert!(matches!(err, SessionError::FrameTooLarge(_)));
    }

    #[test]
    fn cmd_joins_tokens() {
        assert_eq!(specs()[1].cmd(), "http get http://x.example/");
    }
}
