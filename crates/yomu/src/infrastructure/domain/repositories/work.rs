use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow, types::Json};

use crate::{
    domain::{
        entities::work::{Category, NewWork, Work, WorkStatus},
        repositories::work::{WorkRepository, WorkRepositoryError},
    },
    infrastructure::database::Pool,
};

#[derive(Clone)]
pub struct WorkRepositoryImpl {
    pool: Pool,
}

impl WorkRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

fn work_from_row(row: &SqliteRow) -> Result<Work, sqlx::Error> {
    let authors: Json<Vec<String>> = row.try_get("authors")?;
    let status: String = row.try_get("status")?;

    Ok(Work {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        path: row.try_get("path")?,
        title: row.try_get("title")?,
        authors: authors.0,
        synopsis: row.try_get("synopsis")?,
        status: WorkStatus::from(status.as_str()),
        cover_url: row.try_get("cover_url")?,
        in_library: row.try_get("in_library")?,
        last_read_chapter_id: row.try_get("last_read_chapter_id")?,
        last_update: row.try_get("last_update")?,
        update_error: row.try_get("update_error")?,
        date_added: row.try_get("date_added")?,
    })
}

fn category_from_row(row: &SqliteRow) -> Result<Category, sqlx::Error> {
    Ok(Category {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        auto_download: row.try_get("auto_download")?,
    })
}

#[async_trait]
impl WorkRepository for WorkRepositoryImpl {
    async fn insert_work(&self, work: &NewWork) -> Result<i64, WorkRepositoryError> {
        let id = sqlx::query_scalar(
            r#"INSERT INTO work(
                source_id,
                path,
                title,
                authors,
                synopsis,
                status,
                cover_url,
                in_library,
                date_added
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, path) DO UPDATE SET
                title=excluded.title,
                authors=excluded.authors,
                synopsis=excluded.synopsis,
                status=excluded.status,
                cover_url=excluded.cover_url,
                in_library=in_library OR excluded.in_library
            RETURNING id"#,
        )
        .bind(work.source_id)
        .bind(&work.path)
        .bind(&work.metadata.title)
        .bind(Json(&work.metadata.authors))
        .bind(&work.metadata.synopsis)
        .bind(work.metadata.status.as_str())
        .bind(&work.metadata.cover_url)
        .bind(work.in_library)
        .bind(chrono::Utc::now().naive_utc())
        .fetch_one(&self.pool as &SqlitePool)
        .await?;

        Ok(id)
    }

    async fn get_work_by_id(&self, id: i64) -> Result<Work, WorkRepositoryError> {
        let row = sqlx::query("SELECT * FROM work WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool as &SqlitePool)
            .await?;

        Ok(work_from_row(&row)?)
    }

    async fn get_library(&self) -> Result<Vec<Work>, WorkRepositoryError> {
        let works = sqlx::query("SELECT * FROM work WHERE in_library = true ORDER BY title")
            .fetch_all(&self.pool as &SqlitePool)
            .await?
            .iter()
            .map(work_from_row)
            .collect::<Result<_, _>>()?;

        Ok(works)
    }

    async fn get_works_by_category(
        &self,
        category_id: i64,
    ) -> Result<Vec<Work>, WorkRepositoryError> {
        let works = sqlx::query(
            r#"SELECT work.* FROM work
            JOIN work_category ON work_category.work_id = work.id
            WHERE work_category.category_id = ? AND work.in_library = true
            ORDER BY work.title"#,
        )
        .bind(category_id)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .iter()
        .map(work_from_row)
        .collect::<Result<_, _>>()?;

        Ok(works)
    }

    async fn get_work_categories(
        &self,
        work_id: i64,
    ) -> Result<Vec<Category>, WorkRepositoryError> {
        let categories = sqlx::query(
            r#"SELECT category.* FROM category
            JOIN work_category ON work_category.category_id = category.id
            WHERE work_category.work_id = ?
            ORDER BY category.name"#,
        )
        .bind(work_id)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .iter()
        .map(category_from_row)
        .collect::<Result<_, _>>()?;

        Ok(categories)
    }

    async fn set_update_error(
        &self,
        work_id: i64,
        error: Option<&str>,
    ) -> Result<(), WorkRepositoryError> {
        sqlx::query("UPDATE work SET update_error = ? WHERE id = ?")
            .bind(error)
            .bind(work_id)
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(())
    }

    async fn create_category(
        &self,
        name: &str,
        auto_download: bool,
    ) -> Result<Category, WorkRepositoryError> {
        let row = sqlx::query(
            r#"INSERT INTO category(name, auto_download) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET auto_download=excluded.auto_download
            RETURNING id, name, auto_download"#,
        )
        .bind(name)
        .bind(auto_download)
        .fetch_one(&self.pool as &SqlitePool)
        .await?;

        Ok(category_from_row(&row)?)
    }

    async fn set_work_categories(
        &self,
        work_id: i64,
        category_ids: &[i64],
    ) -> Result<(), WorkRepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM work_category WHERE work_id = ?")
            .bind(work_id)
            .execute(&mut *tx)
            .await?;

        for category_id in category_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO work_category(work_id, category_id) VALUES (?, ?)",
            )
            .bind(work_id)
            .bind(category_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }
}
