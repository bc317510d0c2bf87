//! 配送数据访问层
//!
//! 状态写入统一走乐观锁（`WHERE id = $1 AND version = $2`）：
//! 骑手平台的 webhook 可能并发到达，落后的写入会得到 StaleVersion，
//! 由调用方重读后决定是否重试。

use chrono::{DateTime, Utc};
use flavory_shared::error::FlavoryError;
use sqlx::{PgPool, Postgres, Transaction};

use crate::dispatch::CourierJob;
use crate::error::Result;
use crate::model::{Delivery, DeliveryStatus};

const DELIVERY_COLUMNS: &str = "id, order_id, status, courier_job_id, courier_name, \
     courier_phone, pickup_address, dropoff_address, tracking_url, fee, distance_meters, \
     estimated_pickup_at, estimated_delivery_at, actual_pickup_at, actual_delivery_at, \
     cancel_reason, version, created_at, updated_at";

/// 状态写入时一并落库的字段，None 表示保持原值
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub courier_name: Option<String>,
    pub courier_phone: Option<String>,
    pub tracking_url: Option<String>,
    pub actual_pickup_at: Option<DateTime<Utc>>,
    pub actual_delivery_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

#[derive(Clone)]
pub struct DeliveryRepository {
    pool: PgPool,
}

impl DeliveryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 插入新配送记录，初始状态 PENDING
    ///
    /// `deliveries.order_id` 上的 UNIQUE 约束是一单一送的最终防线，
    /// 冲突时返回已存在的记录，调用方按重复投递处理。
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order_id: i64,
        pickup_address: &str,
        dropoff_address: &str,
    ) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "INSERT INTO deliveries (order_id, status, pickup_address, dropoff_address) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (order_id) DO NOTHING \
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(order_id)
        .bind(DeliveryStatus::Pending)
        .bind(pickup_address)
        .bind(dropoff_address)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(delivery)
    }

    pub async fn find_by_id(&self, delivery_id: i64) -> Result<Delivery> {
        sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = $1"
        ))
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            FlavoryError::NotFound {
                entity: "Delivery".to_string(),
                id: delivery_id.to_string(),
            }
            .into()
        })
    }

    pub async fn find_by_order(&self, order_id: i64) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(delivery)
    }

    pub async fn find_by_job_id(&self, job_id: &str) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE courier_job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(delivery)
    }

    /// 任务创建成功后落库平台侧数据并推进到 SCHEDULED
    pub async fn record_scheduled_job(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        delivery: &Delivery,
        job: &CourierJob,
    ) -> Result<Delivery> {
        sqlx::query_as::<_, Delivery>(&format!(
            "UPDATE deliveries \
             SET status = $3, \
                 courier_job_id = $4, \
                 tracking_url = $5, \
                 fee = $6, \
                 distance_meters = $7, \
                 estimated_pickup_at = $8, \
                 estimated_delivery_at = $9, \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(delivery.id)
        .bind(delivery.version)
        .bind(DeliveryStatus::Scheduled)
        .bind(&job.id)
        .bind(&job.tracking_url)
        .bind(&job.fee)
        .bind(job.distance_meters)
        .bind(job.estimated_pickup_at)
        .bind(job.estimated_delivery_at)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            FlavoryError::StaleVersion {
                entity: "Delivery".to_string(),
                id: delivery.id.to_string(),
            }
            .into()
        })
    }

    /// 乐观锁状态写入
    ///
    /// 版本不匹配返回 StaleVersion，说明另一条 webhook 已经先行推进。
    pub async fn update_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        delivery: &Delivery,
        new_status: DeliveryStatus,
        patch: &StatusPatch,
    ) -> Result<Delivery> {
        sqlx::query_as::<_, Delivery>(&format!(
            "UPDATE deliveries \
             SET status = $3, \
                 courier_name = COALESCE($4, courier_name), \
                 courier_phone = COALESCE($5, courier_phone), \
                 tracking_url = COALESCE($6, tracking_url), \
                 actual_pickup_at = COALESCE($7, actual_pickup_at), \
                 actual_delivery_at = COALESCE($8, actual_delivery_at), \
                 cancel_reason = COALESCE($9, cancel_reason), \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(delivery.id)
        .bind(delivery.version)
        .bind(new_status)
        .bind(&patch.courier_name)
        .bind(&patch.courier_phone)
        .bind(&patch.tracking_url)
        .bind(patch.actual_pickup_at)
        .bind(patch.actual_delivery_at)
        .bind(&patch.cancel_reason)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            FlavoryError::StaleVersion {
                entity: "Delivery".to_string(),
                id: delivery.id.to_string(),
            }
            .into()
        })
    }
}
