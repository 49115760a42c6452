use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{
            ChangePasswordRequest, LoginRequest, LoginResponse, RegisterRequest,
            ResetPasswordRequest, UserList, UserProfile,
        },
        cart::{AddToCartRequest, CartView, UpdateQuantityRequest},
        orders::{
            CheckoutRequest, CheckoutResponse, DashboardSummary, OrderList,
            ShippingReceiptRequest, UpdateOrderStatusRequest,
        },
        products::{CreateProductRequest, ProductList, UpdateProductRequest},
    },
    models::{Cart, CartItem, Order, OrderStatus, PaymentMethod, Product, UserRole},
    response::ApiResponse,
    routes::{admin, auth, cart, health, orders, products},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::register,
        auth::login,
        auth::change_password,
        auth::reset_password,
        auth::me,
        products::list_products,
        products::product_stream,
        products::product_detail_stream,
        products::get_product,
        products::create_product,
        products::update_product,
        products::delete_product,
        cart::cart_view,
        cart::cart_stream,
        cart::add_to_cart,
        cart::update_quantity,
        cart::remove_from_cart,
        cart::clear_cart,
        orders::list_orders,
        orders::order_stream,
        orders::checkout,
        orders::get_order,
        orders::confirm_received,
        admin::list_all_orders,
        admin::all_orders_stream,
        admin::get_order_admin,
        admin::update_order_status,
        admin::add_shipping_receipt,
        admin::dashboard,
        admin::list_users,
        admin::users_stream,
        admin::delete_user
    ),
    components(
        schemas(
            UserRole,
            UserProfile,
            UserList,
            Product,
            Cart,
            CartItem,
            CartView,
            Order,
            OrderStatus,
            PaymentMethod,
            RegisterRequest,
            LoginRequest,
            LoginResponse,
            ChangePasswordRequest,
            ResetPasswordRequest,
            CreateProductRequest,
            UpdateProductRequest,
            ProductList,
            AddToCartRequest,
            UpdateQuantityRequest,
            CheckoutRequest,
            CheckoutResponse,
            OrderList,
            UpdateOrderStatusRequest,
            ShippingReceiptRequest,
            DashboardSummary,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<CartView>,
            ApiResponse<OrderList>,
            ApiResponse<CheckoutResponse>,
            ApiResponse<DashboardSummary>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Products", description = "Catalog endpoints"),
        (name = "Cart", description = "Cart endpoints"),
        (name = "Orders", description = "Order endpoints"),
        (name = "Admin", description = "Back-office endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
