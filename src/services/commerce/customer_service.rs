use crate::{
    entities::commerce::{customer, Customer, CustomerModel},
    errors::ServiceError,
};
use chrono::{NaiveDate, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Customer lookups for checkout and buyer profiles.
#[derive(Clone)]
pub struct CustomerService {
    db: Arc<DatabaseConnection>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterCustomerInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
}

impl CustomerService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Registers a shopper. Emails are stored lowercased and must be unique.
    #[instrument(skip(self, input), fields(email = %input.email))]
    pub async fn register_customer(
        &self,
        mut input: RegisterCustomerInput,
    ) -> Result<CustomerModel, ServiceError> {
        input.email = input.email.trim().to_lowercase();
        input.validate()?;

        let existing = Customer::find()
            .filter(customer::Column::Email.eq(&input.email))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict("Email already registered".to_string()));
        }

        let now = Utc::now();
        let customer = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            email: Set(input.email),
            phone: Set(input.phone),
            date_of_birth: Set(input.date_of_birth),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(customer_id = %customer.id, "Customer registered");
        Ok(customer)
    }

    /// Resolves the shopper behind `x-customer-id`.
    pub async fn find(&self, customer_id: Uuid) -> Result<Option<CustomerModel>, ServiceError> {
        Ok(Customer::find_by_id(customer_id).one(&*self.db).await?)
    }
}
