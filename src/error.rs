use thiserror::Error;

/**
 * 코어가 발생시키는 에러의 종류.
 *
 * 소켓 계열 에러는 방향(read/write)과 원인(타임아웃/리셋)을 구분한다. 태스크 디스패치
 * 루프는 'ClientGracefullyClosed'와 'SystemControl'을 정상 종료로 취급하여 info 레벨로
 * 로깅하고, 그 외의 cycle 에러는 warn으로 로깅한다.
 *
 * 'reset'은 상대측이 커넥션을 닫은 경우를 나타낸다. read가 0을 반환하면 타임아웃이
 * 아닌 리셋으로 보고한다.
 */
#[derive(Debug, Error)]
pub enum Error {
    #[error("socket timeout")]
    SocketTimeout,

    #[error("socket read failed, reset={reset}")]
    SocketRead { reset: bool },

    #[error("socket read fully failed, reset={reset}")]
    SocketReadFully { reset: bool },

    #[error("socket write failed")]
    SocketWrite,

    #[error("runtime initialize failed: {0}")]
    RuntimeInit(String),

    #[error("create task failed: {0}")]
    TaskCreate(String),

    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    #[error("edge token traverse failed")]
    EdgeTokenFail,

    #[error("publish already held by another client")]
    PublishAlreadyHeld,

    #[error("hook rejected: {0}")]
    HookRejected(String),

    #[error("client gracefully closed")]
    ClientGracefullyClosed,

    #[error("system control")]
    SystemControl,

    #[error("config invalid: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /**
     * 클라이언트가 커넥션을 닫은 경우인지 확인한다.
     *
     * 소켓 read/write 에러는 상대측이 떠났다는 뜻이므로 정상 종료로 취급한다.
     * 타임아웃은 여기에 포함되지 않는다.
     */
    pub fn is_client_gracefully_closed(&self) -> bool {
        matches!(
            self,
            Error::ClientGracefullyClosed
                | Error::SocketRead { .. }
                | Error::SocketReadFully { .. }
                | Error::SocketWrite
        )
    }

    /// 내부 제어 목적의 루프 중단(cycle 인터럽트 등)인지 확인한다.
    pub fn is_system_control(&self) -> bool {
        matches!(self, Error::SystemControl)
    }

    /// 소켓 타임아웃인지 확인한다. 리셋과는 구분된다.
    pub fn is_socket_timeout(&self) -> bool {
        matches!(self, Error::SocketTimeout)
    }
}

/**
 * 에러를 슬롯에 보관했다가 다른 태스크에 전달하기 위한 clone.
 *
 * 'std::io::Error'는 'Clone'이 아니기 때문에 kind와 메시지를 보존하는 사본을 만든다.
 */
impl Clone for Error {
    fn clone(&self) -> Error {
        match self {
            Error::SocketTimeout => Error::SocketTimeout,
            Error::SocketRead { reset } => Error::SocketRead { reset: *reset },
            Error::SocketReadFully { reset } => Error::SocketReadFully { reset: *reset },
            Error::SocketWrite => Error::SocketWrite,
            Error::RuntimeInit(s) => Error::RuntimeInit(s.clone()),
            Error::TaskCreate(s) => Error::TaskCreate(s.clone()),
            Error::AdmissionDenied(s) => Error::AdmissionDenied(s.clone()),
            Error::EdgeTokenFail => Error::EdgeTokenFail,
            Error::PublishAlreadyHeld => Error::PublishAlreadyHeld,
            Error::HookRejected(s) => Error::HookRejected(s.clone()),
            Error::ClientGracefullyClosed => Error::ClientGracefullyClosed,
            Error::SystemControl => Error::SystemControl,
            Error::Config(s) => Error::Config(s.clone()),
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// mini-rtmp 연산에 특화된 'Result'.
///
/// 편의를 위해 정의되었다.
pub type Result<T> = std::result::Result<T, Error>;
