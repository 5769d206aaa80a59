/// I/O 辅助
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 在两条字节流之间双向拷贝
///
/// 任一方向拷贝结束（EOF 或出错）即返回，对端写侧做半关；
/// 另一方向随整个连接关闭一并回收。
pub(crate) async fn relay_streams<A, B>(id: u64, client: A, target: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let client_to_target = async {
        tokio::io::copy(&mut client_read, &mut target_write).await?;
        target_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let target_to_client = async {
        tokio::io::copy(&mut target_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    tokio::select! {
        result = client_to_target => {
            if let Err(e) = result {
                debug!(id, "client to target copy ended: {}", e);
            }
        }
        result = target_to_client => {
            if let Err(e) = result {
                debug!(id, "target to client copy ended: {}", e);
            }
        }
    }
}
