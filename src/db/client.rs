//! Raw TDS client creation for the connection pool.

use async_trait::async_trait;
use tiberius::{Client, Config, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub type TdsClient = Client<Compat<TcpStream>>;

/// `bb8` manager opening SQL Server connections over TCP.
#[derive(Debug, Clone)]
pub struct TdsConnectionManager {
    config: Config,
    named_instance: bool,
}

impl TdsConnectionManager {
    pub fn new(config: Config, named_instance: bool) -> Self {
        Self {
            config,
            named_instance,
        }
    }
}

async fn open_stream(config: &Config, named_instance: bool) -> tiberius::Result<TcpStream> {
    let tcp = if named_instance {
        TcpStream::connect_named(config).await?
    } else {
        TcpStream::connect(config.get_addr()).await?
    };
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// Connect, following one Azure SQL gateway redirect if the server asks for it.
pub async fn create_client(config: Config, named_instance: bool) -> tiberius::Result<TdsClient> {
    let tcp = open_stream(&config, named_instance).await?;
    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        Err(tiberius::error::Error::Routing { host, port }) => {
            log::debug!("SQL Server redirected connection to {}:{}", host, port);
            let mut redirected = config;
            redirected.host(&host);
            redirected.port(port);
            let tcp = open_stream(&redirected, false).await?;
            Client::connect(redirected, tcp.compat_write()).await
        }
        Err(err) => Err(err),
    }
}

#[async_trait]
impl bb8::ManageConnection for TdsConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        create_client(self.config.clone(), self.named_instance).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
